//! Wire data model for the scanner controller protocol.
//!
//! Outbound commands are a closed, internally tagged enum keyed by the
//! `method` field. Inbound traffic is kept loosely typed as [`Message`]
//! because the controller pushes objects whose shape depends on the method,
//! and callers expect the payload verbatim. Typed views such as
//! [`DeviceStatus`] and [`StagePosition`] decode on demand.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Response to `MoveStage` when an acknowledgment was requested.
pub const STAGE_STOPPED: &str = "StageStopped";
/// Response to `FocusLen`.
pub const FOCUS_STOPPED: &str = "FocusStopped";
/// Preview pushed by the controller after `NewScan`.
pub const PREVIEW_IMAGE: &str = "PreviewImage";
/// Asynchronous error notification.
pub const ERROR_INFO: &str = "ErrorInfo";

/// A decoded inbound JSON object.
///
/// Every message the controller sends carries a `method` string; anything
/// else (`result`, `code`, stage coordinates, ...) depends on the method.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// The discriminator used to route this message, if present.
    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    pub fn code(&self) -> Option<i64> {
        self.0.get("code").and_then(Value::as_i64)
    }

    /// Whether a `StageStopped` / `FocusStopped` / `ScanStopped` style
    /// response reports success (`result == 0`). `None` when `result` is not
    /// an integer.
    pub fn succeeded(&self) -> Option<bool> {
        self.result().and_then(Value::as_i64).map(|r| r == 0)
    }

    /// Interpret `result` as a path to a file written by the controller.
    pub fn result_path(&self) -> Option<PathBuf> {
        self.result().and_then(Value::as_str).map(PathBuf::from)
    }

    /// Decode the message into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(Value::Object(self.0.clone()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Message {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

/// A command sent to the controller, serialized as one flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method")]
pub enum Command {
    CameraImage,
    NewScan {
        #[serde(rename = "expoWait")]
        expo_wait: u32,
    },
    MoveStage {
        #[serde(rename = "X")]
        x: f64,
        #[serde(rename = "Y")]
        y: f64,
        #[serde(rename = "Z")]
        z: f64,
        ack: bool,
    },
    Stop,
    DeviceInfo,
    StageInfo,
    ControlStage {
        mode: StageCommand,
    },
    SwitchLen {
        mag: String,
    },
    FocusLen {
        mode: FocusMode,
    },
}

impl Command {
    /// The `method` field this command is sent with.
    pub fn method(&self) -> &'static str {
        match self {
            Command::CameraImage => "CameraImage",
            Command::NewScan { .. } => "NewScan",
            Command::MoveStage { .. } => "MoveStage",
            Command::Stop => "Stop",
            Command::DeviceInfo => "DeviceInfo",
            Command::StageInfo => "StageInfo",
            Command::ControlStage { .. } => "ControlStage",
            Command::SwitchLen { .. } => "SwitchLen",
            Command::FocusLen { .. } => "FocusLen",
        }
    }
}

/// Error returned when a mode string is not one of the closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}` (expected one of: {expected})")]
pub struct ParseModeError {
    kind: &'static str,
    value: String,
    expected: String,
}

/// Stage macro commands accepted by `ControlStage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageCommand {
    SlideOut,
    SlideIn,
    SlidePrev,
    SlideNext,
    StageLeft,
    StageRight,
    StageOut,
    StageIn,
    SlideDown,
    StageUp,
    StageHome,
}

impl StageCommand {
    pub const ALL: [StageCommand; 11] = [
        StageCommand::SlideOut,
        StageCommand::SlideIn,
        StageCommand::SlidePrev,
        StageCommand::SlideNext,
        StageCommand::StageLeft,
        StageCommand::StageRight,
        StageCommand::StageOut,
        StageCommand::StageIn,
        StageCommand::SlideDown,
        StageCommand::StageUp,
        StageCommand::StageHome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageCommand::SlideOut => "SlideOut",
            StageCommand::SlideIn => "SlideIn",
            StageCommand::SlidePrev => "SlidePrev",
            StageCommand::SlideNext => "SlideNext",
            StageCommand::StageLeft => "StageLeft",
            StageCommand::StageRight => "StageRight",
            StageCommand::StageOut => "StageOut",
            StageCommand::StageIn => "StageIn",
            StageCommand::SlideDown => "SlideDown",
            StageCommand::StageUp => "StageUp",
            StageCommand::StageHome => "StageHome",
        }
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageCommand {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ParseModeError {
                kind: "stage command",
                value: s.to_string(),
                expected: join_names(Self::ALL.iter().map(StageCommand::as_str)),
            })
    }
}

/// Focus strategies accepted by `FocusLen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FocusMode {
    #[default]
    Fast,
    Auto,
    Manual,
}

impl FocusMode {
    pub const ALL: [FocusMode; 3] = [FocusMode::Fast, FocusMode::Auto, FocusMode::Manual];

    pub fn as_str(&self) -> &'static str {
        match self {
            FocusMode::Fast => "Fast",
            FocusMode::Auto => "Auto",
            FocusMode::Manual => "Manual",
        }
    }
}

impl fmt::Display for FocusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FocusMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ParseModeError {
                kind: "focus mode",
                value: s.to_string(),
                expected: join_names(Self::ALL.iter().map(FocusMode::as_str)),
            })
    }
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(", ")
}

/// Typed view of a `DeviceInfo` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub camera: bool,
    pub controller: bool,
    #[serde(rename = "taskrunning")]
    pub task_running: bool,
    #[serde(rename = "traystep")]
    pub tray_step: i64,
    #[serde(rename = "errorcode")]
    pub error_code: i64,
}

/// Typed view of a `StageInfo` response. Coordinates are in microns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

/// Contents of an `ErrorInfo` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

impl DeviceError {
    /// Extract `code` and `result` from an `ErrorInfo` message.
    ///
    /// The controller normally sends a string `result`; anything else is
    /// rendered as JSON. A missing `code` reads as `-1`.
    pub fn from_message(message: &Message) -> Self {
        let text = match message.result() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Self {
            code: message.code().unwrap_or(-1),
            message: text,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}
