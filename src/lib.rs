//! HD scanner controller client.
//!
//! This library drives a laboratory microscopy scanner through the local
//! controller process that owns the hardware:
//!
//! - `protocol` - Connection, framing and response routing for the
//!   controller's newline-delimited JSON protocol
//! - `scanner` - Typed operations (capture, move, focus, ...) on top of it
//! - `models` - Commands, inbound messages and typed response views
//! - `config` - Host/port/timeout settings
//!
//! # Usage
//!
//! ```ignore
//! use hdscanner::{Scanner, ScannerClient, ScannerConfig, StageCommand};
//!
//! let client = ScannerClient::new(ScannerConfig::load()?);
//! client.connect().await?;
//!
//! let scanner = Scanner::new(client);
//! let status = scanner.device_info().await?;
//! scanner.control_stage(StageCommand::SlideIn).await?;
//! ```

pub mod config;
pub mod models;
pub mod protocol;
pub mod scanner;

pub use config::ScannerConfig;
pub use models::{Command, DeviceError, DeviceStatus, FocusMode, Message, StageCommand, StagePosition};
pub use protocol::{ScannerClient, ScannerError};
pub use scanner::{CommandChannel, Scanner};
