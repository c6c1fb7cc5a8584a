pub mod dispatch;
pub mod rendezvous;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::{Error as WsError, Message};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::certificate::{CertificateStore, SignMethod};
use crate::config::SignerConfig;
use crate::envelope::{Envelope, EnvelopeBuilder, RequestIds};
use crate::error::{Result, SignerError};
use crate::response::SignerResponse;

pub use dispatch::Dispatcher;
pub use rendezvous::{Parked, Rendezvous, WaitOutcome};

/// Lifecycle of the connection to the U-Key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingBootstrap,
    Ready,
    /// Terminal. Reached on an unrecoverable connection error.
    Failed,
}

impl BridgeState {
    fn rank(self) -> u8 {
        match self {
            BridgeState::Disconnected => 0,
            BridgeState::Connecting => 1,
            BridgeState::Connected => 2,
            BridgeState::AwaitingBootstrap => 3,
            BridgeState::Ready => 4,
            BridgeState::Failed => 5,
        }
    }

    pub(crate) fn can_move_to(self, next: BridgeState) -> bool {
        match (self, next) {
            (BridgeState::Failed, _) => false,
            (_, BridgeState::Failed) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

/// Owns the WebSocket to the U-Key and turns its callback-style replies
/// into awaitable results.
///
/// The certificate request goes out as soon as the connection opens;
/// [`await_bootstrap`](Self::await_bootstrap) then waits, bounded, for the
/// reply. Other envelopes go through [`call`](Self::call).
#[derive(Debug)]
pub struct SignerBridge {
    url: String,
    dispatcher: Arc<Dispatcher>,
    ids: RequestIds,
    outbound: mpsc::UnboundedSender<Message>,
    parked: Mutex<Option<Parked>>,
    shutdown: CancellationToken,
}

impl SignerBridge {
    /// Opens the connection and sends the bootstrap certificate request.
    pub async fn start(config: &SignerConfig, store: Arc<CertificateStore>) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(store));
        dispatcher.transition(BridgeState::Connecting);

        let (socket, _) = match connect_async(config.ws_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                dispatcher.close(Some(&e.to_string()));
                return Err(SignerError::Connection(format!(
                    "failed to connect to {}: {e}",
                    config.ws_url
                )));
            }
        };
        dispatcher.transition(BridgeState::Connected);
        warn!(url = %config.ws_url, "established websocket connection to the U-Key");

        // Armed before the reader runs, so an early close still wakes it.
        let parked = dispatcher.arm_bootstrap();

        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(write_frames(sink, queue, Arc::clone(&dispatcher), shutdown.clone()));
        tokio::spawn(read_frames(stream, Arc::clone(&dispatcher), shutdown.clone()));

        let bridge = Self {
            url: config.ws_url.clone(),
            dispatcher,
            ids: RequestIds::new(),
            outbound,
            parked: Mutex::new(Some(parked)),
            shutdown,
        };

        if let Err(e) = bridge.send(&EnvelopeBuilder::certificate_request()) {
            bridge.dispatcher.close(Some(&e.to_string()));
            return Err(e);
        }
        Ok(bridge)
    }

    /// [`start`](Self::start) followed by the bootstrap wait.
    ///
    /// Returns once the certificate reply was handled or the configured
    /// ceiling elapsed. Check the store before relying on the live
    /// certificate.
    pub async fn connect(config: &SignerConfig, store: Arc<CertificateStore>) -> Result<Self> {
        let bridge = Self::start(config, store).await?;
        let outcome = bridge.await_bootstrap(config.bootstrap_timeout).await;

        if bridge.certificates().get(SignMethod::WithoutHash).is_some() {
            info!(?outcome, "U-Key bootstrap complete");
        } else {
            warn!(
                ?outcome,
                "U-Key bootstrap finished without a without-hash certificate"
            );
        }
        Ok(bridge)
    }

    /// Waits at most `timeout` for the bootstrap reply.
    ///
    /// One-shot per [`start`](Self::start): later calls return
    /// [`WaitOutcome::NotArmed`] at once.
    pub async fn await_bootstrap(&self, timeout: Duration) -> WaitOutcome {
        let parked = self.parked.lock().unwrap_or_else(|p| p.into_inner()).take();
        let outcome = match parked {
            Some(parked) => parked.wait(timeout).await,
            None => WaitOutcome::NotArmed,
        };
        if outcome == WaitOutcome::TimedOut {
            warn!(?timeout, "no certificate reply from the U-Key");
        }
        self.dispatcher.transition(BridgeState::Ready);
        outcome
    }

    /// Sends `envelope` and waits up to `timeout` for its correlated reply.
    pub async fn call(&self, envelope: &Envelope, timeout: Duration) -> Result<SignerResponse> {
        let id = envelope.id();
        let reply = self.dispatcher.register(id)?;
        if let Err(e) = self.send(envelope) {
            self.dispatcher.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SignerError::Connection(
                "connection closed before the U-Key answered".to_string(),
            )),
            Err(_) => {
                self.dispatcher.forget(id);
                Err(SignerError::TimeoutExpired(timeout))
            }
        }
    }

    /// Next correlation id on this connection. Every client sharing the
    /// bridge draws from here.
    pub fn next_id(&self) -> i32 {
        self.ids.next_id()
    }

    /// Queues `envelope` without waiting for a reply.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.to_json()?;
        debug!(id = envelope.id(), method = %envelope.method(), "sending envelope");
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| SignerError::Connection(format!("connection to {} is closed", self.url)))
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        self.dispatcher.store()
    }

    pub fn state(&self) -> BridgeState {
        self.dispatcher.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.dispatcher.subscribe()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Closes the socket and fails any call still waiting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.dispatcher.close(None);
    }
}

impl Drop for SignerBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_frames<S>(
    mut sink: S,
    mut queue: mpsc::UnboundedReceiver<Message>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => None,
            message = queue.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        if let Err(e) = sink.send(message).await {
            dispatcher.close(Some(&format!("write failed: {e}")));
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "closing websocket");
    }
}

async fn read_frames<S>(mut stream: S, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let failure = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => dispatcher.on_message(&text),
            Some(Ok(Message::Binary(bytes))) => {
                dispatcher.on_message(&String::from_utf8_lossy(&bytes))
            }
            Some(Ok(Message::Close(frame))) => {
                break Some(format!("closed by the U-Key: {frame:?}"));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e.to_string()),
            None => break Some("connection closed".to_string()),
        }
    };
    dispatcher.close(failure.as_deref());
}
