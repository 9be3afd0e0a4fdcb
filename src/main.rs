//! `hdscanner` - command-line access to the HD scanner controller.
//!
//! Connects to the local controller, runs one command, prints the JSON
//! response (if the command has one) and disconnects.
//!
//! ```text
//! hdscanner [--host HOST] [--port PORT] [--timeout SECS] <COMMAND>
//!
//! Commands:
//!   device-info   stage-info   snap   new-scan   move
//!   stop   control <MODE>   lens <MAG>   focus
//! ```
//!
//! Settings come from the config file and `HDSCANNER_*` variables first
//! (see `hdscanner::config`); flags given here take precedence.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hdscanner::config::parse_timeout;
use hdscanner::scanner::DEFAULT_EXPO_WAIT_MS;
use hdscanner::{FocusMode, Scanner, ScannerClient, ScannerConfig, StageCommand};

/// Connection attempts before giving up on startup.
const CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "hdscanner",
    about = "Drive the HD microscopy scanner through its local controller",
    version
)]
struct Cli {
    /// Controller host.
    #[arg(long)]
    host: Option<String>,

    /// Controller TCP port.
    #[arg(long)]
    port: Option<u16>,

    /// Seconds to wait for a response.
    #[arg(long)]
    timeout: Option<f64>,

    /// Fail the running command when the controller reports `ErrorInfo`.
    #[arg(long)]
    fail_on_device_error: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print device status.
    DeviceInfo,
    /// Print the stage position in microns.
    StageInfo,
    /// Capture an image and print the path of the written file.
    Snap,
    /// Start a new scan session.
    NewScan {
        /// Exposure stabilization wait in milliseconds.
        #[arg(long, default_value_t = DEFAULT_EXPO_WAIT_MS)]
        expo_wait: u32,
        /// Wait for the preview image and print its path.
        #[arg(long)]
        preview: bool,
    },
    /// Move the stage to X/Y/Z (microns).
    Move {
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        x: f64,
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        y: f64,
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        z: f64,
        /// Wait for `StageStopped`.
        #[arg(long)]
        ack: bool,
    },
    /// Stop scanning, focusing and stage movement.
    Stop,
    /// Run a stage macro (SlideOut, SlideIn, StageHome, ...).
    Control { mode: StageCommand },
    /// Switch objective lens, e.g. 20X.
    Lens { mag: String },
    /// Focus the current lens and wait for `FocusStopped`.
    Focus {
        /// Fast, Auto or Manual.
        #[arg(long, default_value_t = FocusMode::Fast)]
        mode: FocusMode,
    },
}

impl Cli {
    /// File and `HDSCANNER_*` settings, with flags applied on top.
    fn scanner_config(&self) -> Result<ScannerConfig> {
        let config = ScannerConfig::load().context("Failed to load scanner config")?;
        self.apply(config)
    }

    fn apply(&self, mut config: ScannerConfig) -> Result<ScannerConfig> {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.timeout {
            config.timeout = parse_timeout(secs).context("Invalid --timeout")?;
        }
        if self.fail_on_device_error {
            config.fail_pending_on_device_error = true;
        }
        Ok(config)
    }
}

/// Run one command; `None` means there is nothing to print.
async fn run(scanner: &Scanner, command: Cmd) -> Result<Option<Value>> {
    let output = match command {
        Cmd::DeviceInfo => Some(scanner.device_info().await?.into_value()),
        Cmd::StageInfo => Some(scanner.stage_info().await?.into_value()),
        Cmd::Snap => {
            let path = scanner.snap_image().await?;
            Some(json!({ "path": path.display().to_string() }))
        }
        Cmd::NewScan { expo_wait, preview } => {
            if preview {
                let path = scanner.new_scan_with_preview(expo_wait).await?;
                Some(json!({ "preview": path.display().to_string() }))
            } else {
                scanner.new_scan(expo_wait).await?;
                None
            }
        }
        Cmd::Move { x, y, z, ack } => scanner
            .move_stage(x, y, z, ack)
            .await?
            .map(|m| m.into_value()),
        Cmd::Stop => {
            scanner.stop().await?;
            None
        }
        Cmd::Control { mode } => {
            scanner.control_stage(mode).await?;
            None
        }
        Cmd::Lens { mag } => {
            scanner.switch_lens(&mag).await?;
            None
        }
        Cmd::Focus { mode } => Some(scanner.focus_lens(mode).await?.into_value()),
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean JSON.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "hdscanner=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let client = ScannerClient::new(cli.scanner_config()?);
    tracing::debug!(
        address = %client.config().address(),
        timeout = ?client.timeout(),
        "using scanner controller"
    );
    client
        .connect_with_retry(CONNECT_ATTEMPTS)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to scanner controller at {}",
                client.config().address()
            )
        })?;

    let scanner = Scanner::new(client);
    let outcome = run(&scanner, cli.command).await;
    scanner.channel().disconnect().await;

    if let Some(value) = outcome? {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn from_env(pairs: &[(&str, &str)]) -> ScannerConfig {
        let mut config = ScannerConfig::default();
        config
            .merge_env(|key: &str| {
                pairs
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            })
            .unwrap();
        config
    }

    #[test]
    fn test_flags_override_environment() {
        let env = from_env(&[("HDSCANNER_HOST", "10.0.0.5"), ("HDSCANNER_PORT", "6000")]);
        let cli = Cli::try_parse_from(["hdscanner", "--port", "7000", "--timeout", "1.5", "stop"])
            .unwrap();

        let config = cli.apply(env).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 7000);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert!(!config.fail_pending_on_device_error);
    }

    #[test]
    fn test_unset_flags_keep_environment() {
        let env = from_env(&[("HDSCANNER_FAIL_ON_DEVICE_ERROR", "true")]);
        let cli = Cli::try_parse_from(["hdscanner", "device-info"]).unwrap();

        assert_eq!(cli.apply(env.clone()).unwrap(), env);
    }

    #[test]
    fn test_invalid_timeout_flag_is_rejected() {
        let cli = Cli::try_parse_from(["hdscanner", "--timeout", "0", "stop"]).unwrap();
        assert!(cli.apply(ScannerConfig::default()).is_err());
    }
}
