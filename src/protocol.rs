//! Client for the scanner controller's device protocol.
//!
//! The controller is a local process that speaks newline-terminated JSON
//! objects over a plain TCP stream, in both directions:
//!
//! ```text
//! ┌─────────────────┐           TCP (loopback)          ┌──────────────────────┐
//! │  ScannerClient  │  ──── {"method":"StageInfo"}\n ──► │  scanner controller  │
//! │  (this crate)   │  ◄─── {"method":"StageInfo",…}\n ─ │                      │
//! └─────────────────┘                                   └──────────────────────┘
//! ```
//!
//! # Protocol
//!
//! There are no request IDs. A response is recognised by its `method`
//! field, which usually mirrors the request (`DeviceInfo` → `DeviceInfo`)
//! but not always (`FocusLen` → `FocusStopped`). The controller also pushes
//! messages nobody asked for, and reports failures asynchronously as
//! `{"method":"ErrorInfo","result":"...","code":N}`.
//!
//! - `framing` extracts complete objects from the byte stream
//! - `dispatch` routes each object to a waiter, or logs it
//! - `client` owns the connection and the receive loop
//!
//! # Usage
//!
//! ```ignore
//! use hdscanner::protocol::ScannerClient;
//! use hdscanner::ScannerConfig;
//! use serde_json::json;
//!
//! let client = ScannerClient::new(ScannerConfig::default());
//! client.connect().await?;
//! let info = client.send(&json!({"method": "DeviceInfo"}), Some("DeviceInfo")).await?;
//! ```

mod client;
mod dispatch;
mod framing;

pub use client::{ScannerClient, ScannerError};
pub use dispatch::{Dispatched, Dispatcher, WaiterRx};
pub use framing::{FramingError, JsonFramer, MAX_FRAME_SIZE};
