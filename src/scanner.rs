//! Typed scanner operations built on the protocol client.
//!
//! Each operation fixes how its response is matched:
//!
//! | Operation        | Sends          | Awaits                          |
//! |------------------|----------------|---------------------------------|
//! | `capture_image`  | `CameraImage`  | `CameraImage`                   |
//! | `new_scan`       | `NewScan`      | nothing                         |
//! | `move_stage`     | `MoveStage`    | `StageStopped` if `ack`         |
//! | `stop`           | `Stop`         | nothing                         |
//! | `device_info`    | `DeviceInfo`   | `DeviceInfo`                    |
//! | `stage_info`     | `StageInfo`    | `StageInfo`                     |
//! | `control_stage`  | `ControlStage` | nothing                         |
//! | `switch_lens`    | `SwitchLen`    | nothing                         |
//! | `focus_lens`     | `FocusLen`     | `FocusStopped`                  |
//!
//! Every operation logs its call, result and failure through `tracing`.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::models::{
    Command, FocusMode, Message, StageCommand, FOCUS_STOPPED, PREVIEW_IMAGE, STAGE_STOPPED,
};
use crate::protocol::{ScannerClient, ScannerError};

/// Default exposure stabilization wait for `NewScan`, in milliseconds.
pub const DEFAULT_EXPO_WAIT_MS: u32 = 1000;

/// Send/await primitives the façade is built on.
///
/// Implemented by [`ScannerClient`]; tests substitute a scripted channel.
#[allow(async_fn_in_trait)]
pub trait CommandChannel {
    /// Write `command`; with `expect`, await the first message of that method.
    async fn send(&self, command: &Command, expect: Option<&str>) -> Result<Option<Message>, ScannerError>;

    /// Await the next message of `method` without sending anything.
    async fn wait_for(&self, method: &str, timeout: Duration) -> Result<Message, ScannerError>;
}

impl CommandChannel for ScannerClient {
    async fn send(&self, command: &Command, expect: Option<&str>) -> Result<Option<Message>, ScannerError> {
        ScannerClient::send(self, command, expect).await
    }

    async fn wait_for(&self, method: &str, timeout: Duration) -> Result<Message, ScannerError> {
        ScannerClient::wait_for(self, method, timeout).await
    }
}

/// High-level scanner operations.
///
/// # Example
///
/// ```no_run
/// use hdscanner::{FocusMode, Scanner, ScannerClient, ScannerConfig};
///
/// # async fn example() -> Result<(), hdscanner::ScannerError> {
/// let client = ScannerClient::new(ScannerConfig::default());
/// client.connect().await?;
///
/// let scanner = Scanner::new(client);
/// scanner.move_stage(1000.0, 2000.0, 0.0, true).await?;
/// let focus = scanner.focus_lens(FocusMode::Fast).await?;
/// let image = scanner.snap_image().await?;
/// # Ok(())
/// # }
/// ```
pub struct Scanner<C = ScannerClient> {
    channel: C,
}

impl<C: CommandChannel> Scanner<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Capture a still image. The response's `result` is the path of the
    /// image file the controller wrote.
    pub async fn capture_image(&self) -> Result<Message, ScannerError> {
        log_call("capture_image", String::new(), self.request(Command::CameraImage, "CameraImage")).await
    }

    /// Capture a still image and return the path of the written file.
    pub async fn snap_image(&self) -> Result<PathBuf, ScannerError> {
        log_call("snap_image", String::new(), async {
            let response = self.request(Command::CameraImage, "CameraImage").await?;
            image_path(&response)
        })
        .await
    }

    /// Start a new scan session. The controller later pushes a
    /// `PreviewImage`; use [`new_scan_with_preview`](Self::new_scan_with_preview)
    /// to wait for it.
    pub async fn new_scan(&self, expo_wait_ms: u32) -> Result<(), ScannerError> {
        log_call("new_scan", format!("expo_wait={}", expo_wait_ms), async {
            self.fire(Command::NewScan {
                expo_wait: expo_wait_ms,
            })
            .await
        })
        .await
    }

    /// Start a new scan session and return the path of its preview image.
    pub async fn new_scan_with_preview(&self, expo_wait_ms: u32) -> Result<PathBuf, ScannerError> {
        log_call("new_scan_with_preview", format!("expo_wait={}", expo_wait_ms), async {
            let command = Command::NewScan {
                expo_wait: expo_wait_ms,
            };
            let preview = self.request(command, PREVIEW_IMAGE).await?;
            image_path(&preview)
        })
        .await
    }

    /// Move the stage to `(x, y, z)` in microns.
    ///
    /// With `ack`, waits for `StageStopped` and returns it; otherwise
    /// returns `None` as soon as the command is written.
    pub async fn move_stage(&self, x: f64, y: f64, z: f64, ack: bool) -> Result<Option<Message>, ScannerError> {
        let command = Command::MoveStage { x, y, z, ack };
        let expect = ack.then_some(STAGE_STOPPED);
        log_call(
            "move_stage",
            format!("x={} y={} z={} ack={}", x, y, z, ack),
            self.channel.send(&command, expect),
        )
        .await
    }

    /// Stop scanning, focusing and stage movement.
    pub async fn stop(&self) -> Result<(), ScannerError> {
        log_call("stop", String::new(), self.fire(Command::Stop)).await
    }

    /// Device status, returned verbatim. Decode with
    /// [`DeviceStatus`](crate::models::DeviceStatus) for typed access.
    pub async fn device_info(&self) -> Result<Message, ScannerError> {
        log_call("device_info", String::new(), self.request(Command::DeviceInfo, "DeviceInfo")).await
    }

    /// Stage position, returned verbatim. Decode with
    /// [`StagePosition`](crate::models::StagePosition) for typed access.
    pub async fn stage_info(&self) -> Result<Message, ScannerError> {
        log_call("stage_info", String::new(), self.request(Command::StageInfo, "StageInfo")).await
    }

    pub async fn control_stage(&self, mode: StageCommand) -> Result<(), ScannerError> {
        log_call(
            "control_stage",
            format!("mode={}", mode),
            self.fire(Command::ControlStage { mode }),
        )
        .await
    }

    /// Switch objective lens, e.g. `"20X"`.
    pub async fn switch_lens(&self, mag: &str) -> Result<(), ScannerError> {
        log_call(
            "switch_lens",
            format!("mag={}", mag),
            self.fire(Command::SwitchLen {
                mag: mag.to_string(),
            }),
        )
        .await
    }

    /// Focus the current lens and wait for `FocusStopped`.
    ///
    /// The waiter is registered before `FocusLen` is written, so other
    /// messages arriving first are not mistaken for completion and a fast
    /// `FocusStopped` is not missed.
    pub async fn focus_lens(&self, mode: FocusMode) -> Result<Message, ScannerError> {
        log_call(
            "focus_lens",
            format!("mode={}", mode),
            self.request(Command::FocusLen { mode }, FOCUS_STOPPED),
        )
        .await
    }

    /// Await the next message of `method`, e.g. a `PreviewImage` after a
    /// plain [`new_scan`](Self::new_scan).
    pub async fn wait_for(&self, method: &str, timeout: Duration) -> Result<Message, ScannerError> {
        log_call(
            "wait_for",
            format!("method={} timeout={:?}", method, timeout),
            self.channel.wait_for(method, timeout),
        )
        .await
    }

    async fn fire(&self, command: Command) -> Result<(), ScannerError> {
        self.channel.send(&command, None).await.map(|_| ())
    }

    async fn request(&self, command: Command, expect: &str) -> Result<Message, ScannerError> {
        self.channel
            .send(&command, Some(expect))
            .await?
            .ok_or_else(|| ScannerError::Protocol(format!("No `{}` response delivered", expect)))
    }
}

fn image_path(response: &Message) -> Result<PathBuf, ScannerError> {
    response.result_path().ok_or_else(|| {
        ScannerError::Protocol(format!(
            "`{}` response has no image path: {}",
            response.method().unwrap_or("<none>"),
            response
        ))
    })
}

/// Log an operation's call, result and failure around `call`.
async fn log_call<T, F>(operation: &str, args: String, call: F) -> Result<T, ScannerError>
where
    T: fmt::Debug,
    F: Future<Output = Result<T, ScannerError>>,
{
    info!(operation, args = %args, "scanner call");
    match call.await {
        Ok(value) => {
            debug!(operation, result = ?value, "scanner call succeeded");
            Ok(value)
        }
        Err(e) => {
            error!(operation, error = %e, "scanner call failed");
            Err(e)
        }
    }
}
