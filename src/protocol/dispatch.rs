//! Routing of decoded messages to pending waiters.
//!
//! The controller protocol has no request IDs, so responses are correlated
//! by their `method` field alone. The dispatcher keeps at most one waiter
//! per discriminator; a second registration for a discriminator that is
//! still being awaited is refused with [`ScannerError::AlreadyPending`].
//!
//! Every inbound message lands in exactly one branch of [`Dispatched`]:
//!
//! ```text
//!  method has waiter? ──yes──► Response     (waiter removed, resolved once)
//!        │ no
//!  method == ErrorInfo ─yes──► DeviceError  (logged; optionally fails waiters)
//!        │ no
//!        └─────────────────► Unsolicited   (logged)
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::client::ScannerError;
use crate::models::{DeviceError, Message, ERROR_INFO};

type Waiter = oneshot::Sender<Result<Message, ScannerError>>;

/// Receiving side of a registered waiter.
pub type WaiterRx = oneshot::Receiver<Result<Message, ScannerError>>;

/// Outcome of dispatching one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Delivered to the waiter registered under `method`.
    Response { method: String },
    /// An `ErrorInfo` notification; `failed` waiters were rejected with it.
    DeviceError { error: DeviceError, failed: usize },
    /// No waiter and not an error notification.
    Unsolicited(Message),
}

/// Table of pending waiters keyed by expected `method`.
#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: Mutex<HashMap<String, Waiter>>,
    fail_pending_on_device_error: bool,
}

impl Dispatcher {
    pub fn new(fail_pending_on_device_error: bool) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            fail_pending_on_device_error,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        // The map holds no invariants a panicking holder could break.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for the next message whose `method` equals `method`.
    ///
    /// An entry whose receiver was already dropped (its caller gave up) is
    /// replaced silently.
    ///
    /// # Errors
    ///
    /// Returns [`ScannerError::AlreadyPending`] if a live waiter is already
    /// registered for `method`.
    pub fn register(&self, method: &str) -> Result<WaiterRx, ScannerError> {
        let mut pending = self.pending();
        if let Some(existing) = pending.get(method) {
            if !existing.is_closed() {
                warn!(method, "refusing second waiter for pending response");
                return Err(ScannerError::AlreadyPending(method.to_string()));
            }
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(method.to_string(), tx);
        debug!(method, pending = pending.len(), "registered waiter");
        Ok(rx)
    }

    /// Remove the waiter for `method` once its receiver has been dropped.
    ///
    /// A live waiter is left alone: after a timeout another caller may
    /// already have registered the same discriminator.
    pub fn deregister(&self, method: &str) {
        let mut pending = self.pending();
        if pending.get(method).is_some_and(|tx| tx.is_closed()) {
            pending.remove(method);
            debug!(method, "deregistered abandoned waiter");
        }
    }

    pub fn is_pending(&self, method: &str) -> bool {
        self.pending().get(method).is_some_and(|tx| !tx.is_closed())
    }

    /// Discriminators currently awaited, sorted. Abandoned waiters are
    /// pruned first.
    pub fn pending_methods(&self) -> Vec<String> {
        let mut pending = self.pending();
        pending.retain(|_, tx| !tx.is_closed());
        let mut methods: Vec<String> = pending.keys().cloned().collect();
        methods.sort_unstable();
        methods
    }

    /// Route one decoded message.
    pub fn dispatch(&self, message: Message) -> Dispatched {
        let message = match self.deliver(message) {
            Ok(method) => return Dispatched::Response { method },
            Err(message) => message,
        };

        if message.method() == Some(ERROR_INFO) {
            let device_error = DeviceError::from_message(&message);
            error!(
                code = device_error.code,
                result = %device_error.message,
                "scanner reported an error"
            );
            let failed = if self.fail_pending_on_device_error {
                self.fail_all(|| ScannerError::Device {
                    code: device_error.code,
                    message: device_error.message.clone(),
                })
            } else {
                0
            };
            if failed > 0 {
                warn!(failed, "failed pending requests after device error");
            }
            return Dispatched::DeviceError {
                error: device_error,
                failed,
            };
        }

        self.unsolicited(message)
    }

    /// Hand `message` to a live waiter for its `method`, or give it back.
    ///
    /// A waiter whose caller went away is removed and does not count as a
    /// delivery.
    fn deliver(&self, message: Message) -> Result<String, Message> {
        let Some(method) = message.method().map(str::to_owned) else {
            return Err(message);
        };
        let Some(tx) = self.pending().remove(&method) else {
            return Err(message);
        };

        match tx.send(Ok(message)) {
            Ok(()) => {
                debug!(method = %method, "delivered response");
                Ok(method)
            }
            Err(Ok(message)) => {
                debug!(method = %method, "pruned abandoned waiter");
                Err(message)
            }
            Err(Err(_)) => unreachable!("only responses are delivered here"),
        }
    }

    fn unsolicited(&self, message: Message) -> Dispatched {
        info!(
            method = message.method().unwrap_or("<none>"),
            payload = %message,
            "unhandled scanner message"
        );
        Dispatched::Unsolicited(message)
    }

    /// Fail and remove every pending waiter. Returns how many live waiters
    /// were failed; abandoned ones are only removed.
    pub fn fail_all(&self, error: impl Fn() -> ScannerError) -> usize {
        let drained: Vec<(String, Waiter)> = self.pending().drain().collect();
        let mut count = 0;
        for (method, tx) in drained {
            if tx.send(Err(error())).is_ok() {
                debug!(method = %method, "failed pending waiter");
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn message(value: serde_json::Value) -> Message {
        Message::try_from(value).expect("object")
    }

    #[tokio::test]
    async fn test_response_resolves_waiter_once() {
        let dispatcher = Dispatcher::new(false);
        let rx = dispatcher.register("DeviceInfo").unwrap();

        let msg = message(json!({"method": "DeviceInfo", "camera": true}));
        assert_eq!(
            dispatcher.dispatch(msg.clone()),
            Dispatched::Response {
                method: "DeviceInfo".to_string()
            }
        );
        assert_eq!(rx.await.unwrap().unwrap(), msg);
        assert!(!dispatcher.is_pending("DeviceInfo"));

        // Same method again with nobody waiting.
        let again = message(json!({"method": "DeviceInfo", "camera": false}));
        assert_eq!(dispatcher.dispatch(again.clone()), Dispatched::Unsolicited(again));
    }

    #[test]
    fn test_double_registration_is_rejected() {
        let dispatcher = Dispatcher::new(false);
        let _rx = dispatcher.register("StageInfo").unwrap();

        let err = dispatcher.register("StageInfo").unwrap_err();
        assert!(matches!(err, ScannerError::AlreadyPending(ref m) if m == "StageInfo"));
        assert_eq!(dispatcher.pending_methods(), vec!["StageInfo".to_string()]);
    }

    #[test]
    fn test_abandoned_waiter_can_be_replaced() {
        let dispatcher = Dispatcher::new(false);
        let rx = dispatcher.register("StageInfo").unwrap();
        drop(rx);

        assert!(dispatcher.register("StageInfo").is_ok());
    }

    #[test]
    fn test_deregister_only_removes_abandoned_waiters() {
        let dispatcher = Dispatcher::new(false);
        let rx = dispatcher.register("FocusStopped").unwrap();

        dispatcher.deregister("FocusStopped");
        assert!(dispatcher.is_pending("FocusStopped"));

        drop(rx);
        dispatcher.deregister("FocusStopped");
        assert!(!dispatcher.is_pending("FocusStopped"));

        // Unknown discriminators are a no-op.
        dispatcher.deregister("Nothing");
    }

    #[tokio::test]
    async fn test_error_info_is_observational_by_default() {
        let dispatcher = Dispatcher::new(false);
        let mut rx = dispatcher.register("StageStopped").unwrap();

        let outcome = dispatcher.dispatch(message(
            json!({"method": "ErrorInfo", "result": "Stage limit reached", "code": 4}),
        ));
        assert_eq!(
            outcome,
            Dispatched::DeviceError {
                error: DeviceError {
                    code: 4,
                    message: "Stage limit reached".to_string()
                },
                failed: 0,
            }
        );
        assert!(dispatcher.is_pending("StageStopped"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_info_can_fail_pending_waiters() {
        let dispatcher = Dispatcher::new(true);
        let stage = dispatcher.register("StageStopped").unwrap();
        let focus = dispatcher.register("FocusStopped").unwrap();

        let outcome = dispatcher.dispatch(message(
            json!({"method": "ErrorInfo", "result": "Stage limit reached", "code": 4}),
        ));
        assert!(matches!(outcome, Dispatched::DeviceError { failed: 2, .. }));

        for rx in [stage, focus] {
            match rx.await.unwrap() {
                Err(ScannerError::Device { code, message }) => {
                    assert_eq!(code, 4);
                    assert_eq!(message, "Stage limit reached");
                }
                other => panic!("expected device error, got {other:?}"),
            }
        }
        assert!(dispatcher.pending_methods().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_for_error_info_takes_precedence() {
        let dispatcher = Dispatcher::new(true);
        let rx = dispatcher.register("ErrorInfo").unwrap();

        let msg = message(json!({"method": "ErrorInfo", "result": "x", "code": 1}));
        assert!(matches!(
            dispatcher.dispatch(msg.clone()),
            Dispatched::Response { .. }
        ));
        assert_eq!(rx.await.unwrap().unwrap(), msg);
    }

    #[test]
    fn test_message_without_method_is_unsolicited() {
        let dispatcher = Dispatcher::new(false);
        let _rx = dispatcher.register("DeviceInfo").unwrap();

        let msg = message(json!({"result": 0}));
        assert_eq!(dispatcher.dispatch(msg.clone()), Dispatched::Unsolicited(msg));
        assert!(dispatcher.is_pending("DeviceInfo"));
    }

    #[tokio::test]
    async fn test_fail_all_drains_table() {
        let dispatcher = Dispatcher::new(false);
        let rx = dispatcher.register("CameraImage").unwrap();

        assert_eq!(dispatcher.fail_all(|| ScannerError::ConnectionClosed), 1);
        assert!(matches!(rx.await.unwrap(), Err(ScannerError::ConnectionClosed)));
        assert_eq!(dispatcher.fail_all(|| ScannerError::ConnectionClosed), 0);
    }

    #[tokio::test]
    async fn test_response_for_abandoned_waiter_is_unsolicited() {
        let dispatcher = Dispatcher::new(false);
        let rx = dispatcher.register("StageStopped").unwrap();
        drop(rx);

        assert!(!dispatcher.is_pending("StageStopped"));
        assert!(dispatcher.pending_methods().is_empty());

        let msg = message(json!({"method": "StageStopped"}));
        assert_eq!(dispatcher.dispatch(msg.clone()), Dispatched::Unsolicited(msg));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_swallow_error_info() {
        let dispatcher = Dispatcher::new(false);
        drop(dispatcher.register("ErrorInfo").unwrap());

        let outcome = dispatcher.dispatch(message(
            json!({"method": "ErrorInfo", "result": "Tray open", "code": 2}),
        ));
        assert!(matches!(outcome, Dispatched::DeviceError { failed: 0, .. }));
    }

    #[test]
    fn test_fail_all_skips_abandoned_waiters() {
        let dispatcher = Dispatcher::new(false);
        let _live = dispatcher.register("CameraImage").unwrap();
        drop(dispatcher.register("DeviceInfo").unwrap());

        assert_eq!(dispatcher.fail_all(|| ScannerError::ConnectionClosed), 1);
    }
}
