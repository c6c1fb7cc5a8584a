//! A stand-in for the customs U-Key's local websocket service.
//!
//! Answers the five U-Key methods with deterministic fake results so the
//! signer bridge can be exercised without hardware.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_tungstenite::tokio::accept_async;
use async_tungstenite::tungstenite::Message;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sha1::{Digest, Sha1};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_PASSWORD: &str = "88888888";

/// How the mock answers the bootstrap certificate request.
#[derive(Debug, Clone)]
pub enum CertificateReply {
    /// `Result: true` with the given body as the only data item.
    Certificate(String),
    /// `Result: false` with an error message.
    Refused,
    /// A frame that is not valid JSON.
    Malformed,
    /// No reply at all.
    Silent,
    /// Closes the connection right after the handshake.
    Hangup,
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub certificate: CertificateReply,
    /// Password the sign methods accept.
    pub password: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            certificate: CertificateReply::Certificate("BBBB".to_string()),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

impl MockConfig {
    pub fn with_certificate(certificate: CertificateReply) -> Self {
        Self {
            certificate,
            ..Self::default()
        }
    }
}

/// The signature the mock returns for `in_data`.
pub fn fake_signature(in_data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"mock-ukey:");
    hasher.update(in_data.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A running mock. Stops accepting connections when dropped.
pub struct MockUkey {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl MockUkey {
    /// Binds an ephemeral local port and starts serving.
    pub async fn spawn(config: MockConfig) -> Result<Self> {
        Self::bind("127.0.0.1:0", config).await
    }

    pub async fn bind(addr: &str, config: MockConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(accept_loop(listener, Arc::new(config), Arc::clone(&received)));
        info!(%addr, "mock U-Key listening");
        Ok(Self {
            addr,
            received,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every request envelope received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Serves until the task is aborted.
    pub async fn serve_forever(mut self) -> Result<()> {
        (&mut self.task).await.context("mock U-Key task")
    }
}

impl Drop for MockUkey {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<MockConfig>,
    received: Arc<Mutex<Vec<Value>>>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(%peer, "client connected");
        tokio::spawn(serve_connection(stream, Arc::clone(&config), Arc::clone(&received)));
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: Arc<MockConfig>,
    received: Arc<Mutex<Vec<Value>>>,
) {
    let mut socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };

    if matches!(config.certificate, CertificateReply::Hangup) {
        debug!("hanging up");
        let _ = SinkExt::close(&mut socket).await;
        return;
    }

    while let Some(frame) = socket.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let request: Value = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable request");
                continue;
            }
        };
        received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        if let Some(reply) = answer(&config, &request) {
            if socket.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    }
}

/// The reply text for one request, or `None` to stay silent.
fn answer(config: &MockConfig, request: &Value) -> Option<String> {
    let id = request.get("_id").and_then(Value::as_i64).unwrap_or_default();
    let method = request.get("_method").and_then(Value::as_str).unwrap_or_default();

    let args = match method {
        "cus-sec_SpcGetSignCertAsPEM" => match &config.certificate {
            CertificateReply::Certificate(body) => ok(vec![body.clone()]),
            CertificateReply::Refused => refused("no signing certificate on the key"),
            CertificateReply::Malformed => return Some(format!("{{\"_id\":{id},\"_args\":")),
            CertificateReply::Silent | CertificateReply::Hangup => return None,
        },
        "cus-sec_SpcSHA1DigestAsPEM" => {
            if arg(request, "passwd") != config.password {
                refused("password incorrect")
            } else {
                ok(vec![STANDARD.encode(Sha1::digest(arg(request, "szInfo").as_bytes()))])
            }
        }
        "cus-sec_SpcSignDataAsPEM" | "cus-sec_SpcSignDataNoHashAsPEM" => {
            if arg(request, "passwd") != config.password {
                refused("password incorrect")
            } else {
                ok(vec![fake_signature(arg(request, "inData")), "01".to_string()])
            }
        }
        "cus-sec_SpcVerifySignDataNoHash" => {
            let valid = fake_signature(arg(request, "inData")) == arg(request, "signData");
            json!({"Result": valid, "Data": [], "Error": []})
        }
        other => refused(&format!("unknown method {other}")),
    };

    Some(json!({"_id": id, "_method": method, "_status": "00", "_args": args}).to_string())
}

fn arg<'a>(request: &'a Value, key: &str) -> &'a str {
    request
        .get("args")
        .and_then(|args| args.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn ok(data: Vec<String>) -> Value {
    json!({"Result": true, "Data": data, "Error": []})
}

fn refused(reason: &str) -> Value {
    json!({"Result": false, "Data": [], "Error": [reason]})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(config: &MockConfig, request: Value) -> Value {
        serde_json::from_str(&answer(config, &request).unwrap()).unwrap()
    }

    #[test]
    fn certificate_reply_carries_body() {
        let config = MockConfig::default();
        let value = reply(
            &config,
            json!({"_method": "cus-sec_SpcGetSignCertAsPEM", "_id": 1, "args": {}}),
        );
        assert_eq!(value["_id"], 1);
        assert_eq!(value["_args"]["Result"], true);
        assert_eq!(value["_args"]["Data"][0], "BBBB");
    }

    #[test]
    fn silent_certificate_has_no_reply() {
        let config = MockConfig::with_certificate(CertificateReply::Silent);
        let request = json!({"_method": "cus-sec_SpcGetSignCertAsPEM", "_id": 1, "args": {}});
        assert!(answer(&config, &request).is_none());
    }

    #[test]
    fn malformed_certificate_reply_is_not_json() {
        let config = MockConfig::with_certificate(CertificateReply::Malformed);
        let request = json!({"_method": "cus-sec_SpcGetSignCertAsPEM", "_id": 1, "args": {}});
        let text = answer(&config, &request).unwrap();
        assert!(serde_json::from_str::<Value>(&text).is_err());
    }

    #[test]
    fn wrong_password_is_refused() {
        let value = reply(
            &MockConfig::default(),
            json!({"_method": "cus-sec_SpcSignDataAsPEM", "_id": 5,
                   "args": {"inData": "x", "passwd": "00000000"}}),
        );
        assert_eq!(value["_args"]["Result"], false);
        assert_eq!(value["_args"]["Error"][0], "password incorrect");
    }

    #[test]
    fn verify_accepts_its_own_signature() {
        let signature = fake_signature("abc");
        let value = reply(
            &MockConfig::default(),
            json!({"_method": "cus-sec_SpcVerifySignDataNoHash", "_id": 6,
                   "args": {"inData": "abc", "signData": signature}}),
        );
        assert_eq!(value["_args"]["Result"], true);
    }
}
