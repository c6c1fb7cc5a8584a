use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use super::BridgeState;
use super::rendezvous::{Parked, Rendezvous};
use crate::certificate::{CertificateStore, SignMethod, strip_pem_markers};
use crate::envelope::BOOTSTRAP_ID;
use crate::error::{Result, SignerError};
use crate::response::SignerResponse;

/// Inbound half of the bridge: routes decoded replies by correlation id.
///
/// Replies to [`BOOTSTRAP_ID`] fill the without-hash certificate and release
/// the bootstrap waiter; every other id goes to the caller that registered
/// it. A reply that fails to decode but still names a pending id fails that
/// caller with [`SignerError::Encoding`]. Transport-agnostic, so any frame source can drive `on_message`.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<CertificateStore>,
    bootstrap: Rendezvous,
    pending: Mutex<HashMap<i32, Reply>>,
    state: watch::Sender<BridgeState>,
}

impl Dispatcher {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        Self {
            store,
            bootstrap: Rendezvous::new(),
            pending: Mutex::new(HashMap::new()),
            state,
        }
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Moves the state machine forward. Returns whether the state changed.
    pub(crate) fn transition(&self, next: BridgeState) -> bool {
        self.state.send_if_modified(|state| {
            if !state.can_move_to(next) {
                return false;
            }
            debug!(from = ?*state, to = ?next, "bridge state");
            *state = next;
            true
        })
    }

    /// Arms the bootstrap waiter and enters `AwaitingBootstrap`. Must run
    /// before the certificate request is sent.
    pub fn arm_bootstrap(&self) -> Parked {
        let parked = self.bootstrap.arm();
        self.transition(BridgeState::AwaitingBootstrap);
        parked
    }

    /// Handles one text frame from the signer.
    pub fn on_message(&self, text: &str) {
        let response = match SignerResponse::decode(text) {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "failed to decode signer response");
                let waiter = loose_id(text).and_then(|id| self.lock_pending().remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    // Could have been the bootstrap reply; never leave the
                    // initializer waiting on it.
                    None if self.bootstrap.is_armed() => self.finish_bootstrap(),
                    None => {}
                }
                return;
            }
        };

        if response.id == BOOTSTRAP_ID {
            self.on_bootstrap(response);
        } else {
            self.deliver(response);
        }
    }

    fn on_bootstrap(&self, response: SignerResponse) {
        let _release = BootstrapRelease(self);

        match response.first_data() {
            Some(certificate) => {
                self.store
                    .put(SignMethod::WithoutHash, strip_pem_markers(certificate));
                warn!("loaded the without-hash signing certificate from the U-Key");
            }
            None => warn!(
                reason = %response.reason(),
                "U-Key returned no signing certificate"
            ),
        }
    }

    fn finish_bootstrap(&self) {
        self.bootstrap.release();
        self.transition(BridgeState::Ready);
    }

    fn deliver(&self, response: SignerResponse) {
        let id = response.id;
        let waiter = self.lock_pending().remove(&id);
        match waiter {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    debug!(id, "caller stopped waiting before the reply arrived");
                }
            }
            None => warn!(id, "no caller awaiting signer response"),
        }
    }

    /// Reserves `id` for one outstanding call.
    ///
    /// Ids only need to be unique among calls still in flight.
    pub fn register(&self, id: i32) -> Result<oneshot::Receiver<Result<SignerResponse>>> {
        if id <= 0 {
            return Err(SignerError::InvalidArgument(format!(
                "correlation id must be positive, got {id}"
            )));
        }
        if id == BOOTSTRAP_ID {
            return Err(SignerError::InvalidArgument(format!(
                "correlation id {BOOTSTRAP_ID} is reserved for the certificate bootstrap"
            )));
        }

        let mut pending = self.lock_pending();
        if pending.get(&id).is_some_and(|tx| !tx.is_closed()) {
            return Err(SignerError::InvalidArgument(format!(
                "correlation id {id} is already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok(rx)
    }

    pub fn forget(&self, id: i32) {
        self.lock_pending().remove(&id);
    }

    pub fn in_flight(&self) -> usize {
        self.lock_pending().len()
    }

    /// Tears down after the connection ends. `failure` is `None` for a
    /// requested shutdown.
    pub(crate) fn close(&self, failure: Option<&str>) {
        match failure {
            Some(reason) => {
                error!(%reason, "signer connection lost");
                self.transition(BridgeState::Failed);
            }
            None => {
                self.state.send_if_modified(|state| {
                    if *state == BridgeState::Failed {
                        return false;
                    }
                    *state = BridgeState::Disconnected;
                    true
                });
            }
        }
        self.bootstrap.release();
        // Dropping the senders fails every waiting caller.
        self.lock_pending().clear();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<i32, Reply>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

type Reply = oneshot::Sender<Result<SignerResponse>>;

/// `_id` of a frame that failed strict decoding, if it has a usable one.
fn loose_id(text: &str) -> Option<i32> {
    let value: Value = serde_json::from_str(text).ok()?;
    let id = value.get("_id").and_then(Value::as_i64)?;
    i32::try_from(id).ok()
}

/// Releases the bootstrap waiter when dropped, however the handler exits.
struct BootstrapRelease<'a>(&'a Dispatcher);

impl Drop for BootstrapRelease<'_> {
    fn drop(&mut self) {
        self.0.finish_bootstrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::rendezvous::WaitOutcome;
    use std::time::Duration;

    const CEILING: Duration = Duration::from_secs(3);

    fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new(Arc::new(CertificateStore::new()));
        dispatcher.transition(BridgeState::Connecting);
        dispatcher.transition(BridgeState::Connected);
        dispatcher
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_reply_stores_certificate_and_releases() {
        let dispatcher = dispatcher();
        let parked = dispatcher.arm_bootstrap();
        assert_eq!(dispatcher.state(), BridgeState::AwaitingBootstrap);

        dispatcher.on_message(r#"{"_id":1,"_args":{"Result":true,"Data":["BBBB"]}}"#);

        assert_eq!(parked.wait(CEILING).await, WaitOutcome::Released);
        assert_eq!(
            dispatcher.store().get(SignMethod::WithoutHash).as_deref(),
            Some("BBBB")
        );
        assert_eq!(dispatcher.state(), BridgeState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_certificate_with_markers_is_stripped() {
        let dispatcher = dispatcher();
        let parked = dispatcher.arm_bootstrap();
        dispatcher.on_message(
            r#"{"_id":1,"_args":{"Result":true,"Data":["-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----"]}}"#,
        );
        assert_eq!(parked.wait(CEILING).await, WaitOutcome::Released);
        assert_eq!(
            dispatcher.store().get(SignMethod::WithoutHash).as_deref(),
            Some("BBBB")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refused_bootstrap_still_releases() {
        let dispatcher = dispatcher();
        let parked = dispatcher.arm_bootstrap();
        dispatcher.on_message(r#"{"_id":1,"_args":{"Result":false,"Error":["no key"]}}"#);

        assert_eq!(parked.wait(CEILING).await, WaitOutcome::Released);
        assert!(dispatcher.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_data_stores_nothing() {
        let dispatcher = dispatcher();
        let parked = dispatcher.arm_bootstrap();
        dispatcher.on_message(r#"{"_id":1,"_args":{"Result":true,"Data":[]}}"#);

        assert_eq!(parked.wait(CEILING).await, WaitOutcome::Released);
        assert!(dispatcher.store().get(SignMethod::WithoutHash).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_releases_without_storing() {
        for text in ["{not json", r#"{"_id":1,"_args":{"Data":["BBBB"]}}"#] {
            let dispatcher = dispatcher();
            let parked = dispatcher.arm_bootstrap();
            dispatcher.on_message(text);

            let started = tokio::time::Instant::now();
            assert_eq!(parked.wait(CEILING).await, WaitOutcome::Released, "{text}");
            assert!(started.elapsed() < CEILING);
            assert!(dispatcher.store().get(SignMethod::WithoutHash).is_none());
        }
    }

    #[tokio::test]
    async fn other_ids_go_to_their_caller() {
        let dispatcher = dispatcher();
        let rx = dispatcher.register(42).unwrap();
        dispatcher.on_message(r#"{"_id":42,"_args":{"Result":true,"Data":["c2ln"]}}"#);

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.id, 42);
        assert_eq!(response.first_data(), Some("c2ln"));
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(dispatcher.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_reply_fails_its_caller_promptly() {
        let dispatcher = dispatcher();
        let rx = dispatcher.register(5).unwrap();
        dispatcher.on_message(r#"{"_id":5,"_args":{"Result":"true","Data":["x"]}}"#);

        assert_eq!(dispatcher.in_flight(), 0);
        let reply = tokio::time::timeout(Duration::from_millis(500), rx)
            .await
            .expect("caller was not answered")
            .unwrap();
        assert!(matches!(reply, Err(SignerError::Encoding(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_reply_for_a_caller_leaves_bootstrap_armed() {
        let dispatcher = dispatcher();
        let parked = dispatcher.arm_bootstrap();
        let _rx = dispatcher.register(5).unwrap();
        dispatcher.on_message(r#"{"_id":5,"_args":{"Result":"true"}}"#);

        assert_eq!(parked.wait(Duration::from_millis(200)).await, WaitOutcome::TimedOut);
    }

    #[test]
    fn loose_id_reads_only_usable_ids() {
        assert_eq!(loose_id(r#"{"_id":7,"_args":{"Result":"yes"}}"#), Some(7));
        assert_eq!(loose_id(r#"{"_id":"7"}"#), None);
        assert_eq!(loose_id(r#"{"_id":4294967296}"#), None);
        assert_eq!(loose_id("{not json"), None);
    }

    #[tokio::test]
    async fn unmatched_reply_is_dropped() {
        let dispatcher = dispatcher();
        let rx = dispatcher.register(5).unwrap();
        dispatcher.on_message(r#"{"_id":6,"_args":{"Result":true}}"#);
        assert_eq!(dispatcher.in_flight(), 1);
        drop(rx);
    }

    #[test]
    fn register_rejects_reserved_and_duplicate_ids() {
        let dispatcher = dispatcher();
        assert!(dispatcher.register(BOOTSTRAP_ID).unwrap_err().is_invalid_argument());
        assert!(dispatcher.register(0).unwrap_err().is_invalid_argument());
        assert!(dispatcher.register(-5).unwrap_err().is_invalid_argument());

        let _rx = dispatcher.register(9).unwrap();
        assert!(dispatcher.register(9).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn abandoned_id_can_be_reused() {
        let dispatcher = dispatcher();
        drop(dispatcher.register(9).unwrap());
        assert!(dispatcher.register(9).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_fails_callers_and_releases_bootstrap() {
        let dispatcher = dispatcher();
        let parked = dispatcher.arm_bootstrap();
        let rx = dispatcher.register(3).unwrap();

        dispatcher.close(Some("reset by peer"));

        assert_eq!(parked.wait(CEILING).await, WaitOutcome::Released);
        assert!(rx.await.is_err());
        assert_eq!(dispatcher.state(), BridgeState::Failed);
        assert!(!dispatcher.transition(BridgeState::Ready));
    }

    #[test]
    fn state_only_moves_forward() {
        let dispatcher = dispatcher();
        assert!(!dispatcher.transition(BridgeState::Connecting));
        assert!(dispatcher.transition(BridgeState::Ready));
        assert!(!dispatcher.transition(BridgeState::AwaitingBootstrap));
        assert!(dispatcher.transition(BridgeState::Failed));
    }
}
