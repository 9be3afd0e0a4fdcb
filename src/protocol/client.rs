//! TCP client for the scanner controller.
//!
//! This module provides `ScannerClient`, which owns the single connection to
//! the controller process, runs the background receive loop, and turns the
//! controller's push-based stream into awaitable request/response calls.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::models::Message;
use crate::protocol::dispatch::{Dispatcher, WaiterRx};
use crate::protocol::framing::JsonFramer;

/// Size of each read from the socket.
const READ_CHUNK: usize = 4096;

/// Scanner client error types.
#[derive(Debug, Error)]
pub enum ScannerError {
    /// Failed to open the TCP connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// An operation needed a connection and none is held.
    #[error("Not connected to the scanner controller")]
    NotConnected,

    /// `connect` was called while a connection is held.
    #[error("Already connected to the scanner controller")]
    AlreadyConnected,

    /// The connection ended while a call was in flight or was already broken.
    #[error("Connection to the scanner controller closed")]
    ConnectionClosed,

    /// No matching response arrived in time.
    #[error("Timed out after {timeout:?} waiting for `{method}`")]
    Timeout {
        /// Expected response discriminator
        method: String,
        /// How long the call waited
        timeout: Duration,
    },

    /// The controller stopped reading and a command could not be written in
    /// time.
    #[error("Timed out after {timeout:?} writing to the scanner controller")]
    WriteTimeout {
        /// How long the write was allowed to take
        timeout: Duration,
    },

    /// A waiter for this discriminator is already registered.
    #[error("A `{0}` response is already being awaited")]
    AlreadyPending(String),

    /// The controller sent `ErrorInfo` while this call was pending.
    #[error("Scanner error {code}: {message}")]
    Device {
        /// Controller error code
        code: i64,
        /// Controller error text
        message: String,
    },

    /// Encoding failure or unexpected response shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ScannerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                ScannerError::ConnectionFailed(err)
            }
            _ => ScannerError::Io(err),
        }
    }
}

/// One live TCP connection and the receive loop reading from it.
struct Connection {
    /// Serializes writes. Held outside the connection slot so a stalled
    /// write never blocks `disconnect` or `is_connected`.
    writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
    /// Cleared when the stream ends or a write stalls.
    alive: Arc<AtomicBool>,
    peer: Option<SocketAddr>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Client for the scanner controller's line-delimited JSON protocol.
///
/// The client holds at most one connection. Requests are correlated with
/// responses by `method` name, so at most one call per expected response
/// may be outstanding at a time.
///
/// # Connection Lifecycle
///
/// - `connect()` - Open the connection and start the receive loop
/// - `send()` / `wait_for()` - Issue commands and await responses
/// - `disconnect()` - Close the connection; pending calls fail immediately
///
/// When the controller closes the stream, pending calls fail with
/// `ScannerError::ConnectionClosed` and further sends are refused until the
/// caller disconnects and connects again. A write that stalls past its
/// timeout leaves the connection in the same state, since part of a line
/// may already be on the wire.
///
/// # Example
///
/// ```no_run
/// use hdscanner::{Command, ScannerClient, ScannerConfig};
///
/// # async fn example() -> Result<(), hdscanner::ScannerError> {
/// let client = ScannerClient::new(ScannerConfig::default());
/// client.connect().await?;
/// let info = client.send(&Command::DeviceInfo, Some("DeviceInfo")).await?;
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct ScannerClient {
    config: ScannerConfig,
    dispatcher: Arc<Dispatcher>,
    /// Only held briefly; never across network I/O.
    connection: Mutex<Option<Connection>>,
}

impl ScannerClient {
    pub fn new(config: ScannerConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.fail_pending_on_device_error));
        Self {
            config,
            dispatcher,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Default response timeout for `send`.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Connect to the controller and start the receive loop.
    ///
    /// # Errors
    ///
    /// - `ScannerError::AlreadyConnected` if a connection is held, even a
    ///   broken one; call `disconnect()` first
    /// - `ScannerError::ConnectionFailed` if the endpoint is unreachable or
    ///   does not answer within the configured timeout
    pub async fn connect(&self) -> Result<(), ScannerError> {
        if self.connection.lock().await.is_some() {
            return Err(ScannerError::AlreadyConnected);
        }

        let host = self.config.host.as_str();
        let port = self.config.port;
        let stream = match timeout(self.config.timeout, TcpStream::connect((host, port))).await {
            Ok(result) => result.map_err(ScannerError::ConnectionFailed)?,
            Err(_) => {
                return Err(ScannerError::ConnectionFailed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "no answer from {} within {:?}",
                        self.config.address(),
                        self.config.timeout
                    ),
                )))
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on scanner connection");
        }
        let peer = stream.peer_addr().ok();

        // Another connect may have won while this one was dialing.
        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            return Err(ScannerError::AlreadyConnected);
        }

        let (read_half, write_half) = stream.into_split();
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(receive_loop(
            read_half,
            Arc::clone(&self.dispatcher),
            Arc::clone(&alive),
        ));

        *slot = Some(Connection {
            writer: Arc::new(Mutex::new(write_half)),
            reader,
            alive,
            peer,
        });
        info!(host, port, "connected to scanner controller");
        Ok(())
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Retries with delays of 100ms, 200ms, 400ms, etc. `AlreadyConnected`
    /// is returned immediately without retrying.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if all attempts fail.
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<(), ScannerError> {
        let attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ ScannerError::AlreadyConnected) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                    warn!(attempt, ?delay, error = %e, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close the connection and stop the receive loop.
    ///
    /// Pending calls fail with `ScannerError::ConnectionClosed`. Safe to call
    /// when never connected, when the connection already broke, or while a
    /// write is stalled; a stalled write runs out on its own timeout.
    pub async fn disconnect(&self) {
        let Some(mut conn) = self.connection.lock().await.take() else {
            return;
        };

        match conn.writer.try_lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "write half already closed");
                }
            }
            Err(_) => debug!("write in progress, skipping write-half shutdown"),
        }
        conn.reader.abort();
        if let Err(e) = (&mut conn.reader).await {
            if !e.is_cancelled() {
                warn!(error = %e, "receive loop ended abnormally");
            }
        }
        conn.alive.store(false, Ordering::Release);

        let failed = self.dispatcher.fail_all(|| ScannerError::ConnectionClosed);
        info!(peer = ?conn.peer, failed, "disconnected from scanner controller");
    }

    /// Whether a connection is held and still usable: its receive loop is
    /// running and no write has stalled.
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.alive.load(Ordering::Acquire))
    }

    /// Discriminators currently awaited, sorted.
    pub fn pending_responses(&self) -> Vec<String> {
        self.dispatcher.pending_methods()
    }

    /// Send a command using the configured timeout.
    ///
    /// See [`send_with_timeout`](Self::send_with_timeout).
    pub async fn send<T>(&self, command: &T, expect: Option<&str>) -> Result<Option<Message>, ScannerError>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_timeout(command, expect, self.config.timeout)
            .await
    }

    /// Write `command` as one JSON line and optionally await a response.
    ///
    /// With `expect` set, a waiter for that discriminator is registered
    /// before the write, so the response cannot slip past, and the call
    /// resolves with the first message whose `method` matches. Without
    /// `expect`, the call returns `Ok(None)` once the line is flushed.
    ///
    /// # Errors
    ///
    /// - `ScannerError::Timeout` if no match arrives within `wait`; the
    ///   waiter is removed
    /// - `ScannerError::WriteTimeout` if the line cannot be written within
    ///   `wait`
    /// - `ScannerError::AlreadyPending` if `expect` is already awaited
    /// - `ScannerError::NotConnected` / `ConnectionClosed` / `Io` on
    ///   connection problems
    pub async fn send_with_timeout<T>(
        &self,
        command: &T,
        expect: Option<&str>,
        wait: Duration,
    ) -> Result<Option<Message>, ScannerError>
    where
        T: Serialize + ?Sized,
    {
        let mut line = serde_json::to_string(command)
            .map_err(|e| ScannerError::Protocol(format!("Failed to serialize command: {}", e)))?;
        line.push('\n');

        let waiter = match expect {
            Some(method) => Some((method, self.dispatcher.register(method)?)),
            None => None,
        };

        if let Err(e) = self.write_line(&line, wait).await {
            if let Some((method, rx)) = waiter {
                drop(rx);
                self.dispatcher.deregister(method);
            }
            return Err(e);
        }

        match waiter {
            Some((method, rx)) => self.await_waiter(method, rx, wait).await.map(Some),
            None => Ok(None),
        }
    }

    /// Await the next message with the given `method`, without sending.
    ///
    /// # Errors
    ///
    /// `ScannerError::Timeout` if nothing matching arrives within `wait`,
    /// `ScannerError::AlreadyPending` if `method` is already awaited.
    pub async fn wait_for(&self, method: &str, wait: Duration) -> Result<Message, ScannerError> {
        let rx = self.dispatcher.register(method)?;
        self.await_waiter(method, rx, wait).await
    }

    async fn write_line(&self, line: &str, wait: Duration) -> Result<(), ScannerError> {
        let deadline = Instant::now() + wait;
        let (writer, alive) = {
            let slot = self.connection.lock().await;
            let conn = slot.as_ref().ok_or(ScannerError::NotConnected)?;
            if !conn.alive.load(Ordering::Acquire) {
                return Err(ScannerError::ConnectionClosed);
            }
            (Arc::clone(&conn.writer), Arc::clone(&conn.alive))
        };

        // Nothing is written yet if the lock itself times out.
        let mut guard = timeout_at(deadline, writer.lock())
            .await
            .map_err(|_| ScannerError::WriteTimeout { timeout: wait })?;
        let write = async {
            guard.write_all(line.as_bytes()).await?;
            guard.flush().await
        };
        match timeout_at(deadline, write).await {
            Ok(result) => result?,
            Err(_) => {
                // Part of the line may be on the wire; the stream is unusable.
                alive.store(false, Ordering::Release);
                warn!(?wait, "write to scanner controller stalled, connection marked broken");
                return Err(ScannerError::WriteTimeout { timeout: wait });
            }
        }
        debug!(command = line.trim_end(), "sent command");
        Ok(())
    }

    async fn await_waiter(
        &self,
        method: &str,
        rx: WaiterRx,
        wait: Duration,
    ) -> Result<Message, ScannerError> {
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScannerError::ConnectionClosed),
            Err(_) => {
                self.dispatcher.deregister(method);
                warn!(method, ?wait, "timed out waiting for response");
                Err(ScannerError::Timeout {
                    method: method.to_string(),
                    timeout: wait,
                })
            }
        }
    }
}

/// Read from the controller until the stream ends, dispatching each object.
///
/// Undecodable or oversized objects are dropped and reading continues. On
/// end-of-stream or a read error the loop marks the connection dead and
/// fails every pending waiter.
async fn receive_loop<R>(mut reader: R, dispatcher: Arc<Dispatcher>, alive: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut framer = JsonFramer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("scanner controller closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "read from scanner controller failed");
                break;
            }
        };

        framer.push(&chunk[..n]);

        // A single read may complete several objects.
        loop {
            match framer.next_frame() {
                Ok(Some(frame)) => match serde_json::from_slice::<Message>(&frame) {
                    Ok(message) => {
                        dispatcher.dispatch(message);
                    }
                    Err(e) => {
                        debug!(
                            error = %e,
                            frame = %String::from_utf8_lossy(&frame),
                            "discarding undecodable frame"
                        );
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "discarding inbound data");
                    break;
                }
            }
        }
    }

    alive.store(false, Ordering::Release);
    let failed = dispatcher.fail_all(|| ScannerError::ConnectionClosed);
    if failed > 0 {
        warn!(failed, "connection lost with requests in flight");
    }
}
