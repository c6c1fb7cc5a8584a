use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::bridge::SignerBridge;
use crate::certificate::{CertificateStore, SignMethod};
use crate::config::SignerConfig;
use crate::envelope::{Envelope, EnvelopeBuilder, Method, SignRequest};
use crate::error::{Result, SignerError};

/// A signature produced by the U-Key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Base64 signature value, the content of `SignatureValue`.
    pub value: String,
    /// Certificate body matching the signing method, for `X509Certificate`.
    pub certificate: String,
    /// Any further items the key returned (e.g. the certificate number).
    pub extra: Vec<String>,
}

/// Digest, sign and verify flows over a connected [`SignerBridge`].
///
/// Signing refuses to run without the certificate its method needs; it never
/// falls back to the other method's certificate.
#[derive(Debug, Clone)]
pub struct SignatureClient {
    bridge: Arc<SignerBridge>,
    builder: EnvelopeBuilder,
    timeout: Duration,
}

impl SignatureClient {
    pub fn new(bridge: Arc<SignerBridge>, builder: EnvelopeBuilder, timeout: Duration) -> Self {
        Self {
            bridge,
            builder,
            timeout,
        }
    }

    pub fn from_config(bridge: Arc<SignerBridge>, config: &SignerConfig) -> Self {
        Self::new(bridge, config.envelope_builder(), config.call_timeout)
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        self.bridge.certificates()
    }

    /// SHA-1 digest of `source` computed by the key.
    #[instrument(skip_all)]
    pub async fn digest(&self, source: &str) -> Result<String> {
        let envelope = self.builder.digest_request(source, self.bridge.next_id())?;
        let mut data = self.round_trip(&envelope).await?;
        first(&mut data, Method::Sha1Digest)
    }

    /// Signs `source`; the key hashes it.
    #[instrument(skip_all)]
    pub async fn sign_with_hash(&self, source: &str) -> Result<Signature> {
        let certificate = self.certificates().require(SignMethod::WithHash)?;
        let request = SignRequest::new(self.bridge.next_id(), source);
        let envelope = self.builder.sign_with_hash_request(&request)?;
        self.sign(&envelope, certificate).await
    }

    /// Signs the hex SHA-1 of `source`, computed locally.
    #[instrument(skip_all)]
    pub async fn sign_no_hash(&self, source: &str) -> Result<Signature> {
        let certificate = self.certificates().require(SignMethod::WithoutHash)?;
        let request = SignRequest::new(self.bridge.next_id(), source);
        let envelope = self.builder.sign_no_hash_request(&request)?;
        self.sign(&envelope, certificate).await
    }

    /// Asks the key whether `signature` is valid for `source`.
    ///
    /// `certificate` selects the verifying certificate; `None` uses the one
    /// on the key.
    #[instrument(skip_all)]
    pub async fn verify_no_hash(
        &self,
        source: &str,
        signature: &str,
        certificate: Option<&str>,
    ) -> Result<bool> {
        let id = self.bridge.next_id();
        let envelope = self
            .builder
            .verify_no_hash_request(source, signature, certificate, id)?;
        let response = self.bridge.call(&envelope, self.timeout).await?;
        debug!(id = response.id, result = ?response.args.result, "verify reply");
        if response.args.result.is_none() {
            return Err(SignerError::Rejected {
                method: Method::VerifySignDataNoHash.name(),
                reason: response.reason(),
            });
        }
        Ok(response.succeeded())
    }

    async fn sign(&self, envelope: &Envelope, certificate: String) -> Result<Signature> {
        let mut data = self.round_trip(envelope).await?;
        let value = first(&mut data, envelope.method())?;
        Ok(Signature {
            value,
            certificate,
            extra: data,
        })
    }

    async fn round_trip(&self, envelope: &Envelope) -> Result<Vec<String>> {
        let response = self.bridge.call(envelope, self.timeout).await?;
        debug!(id = response.id, method = %envelope.method(), "signer reply");
        response.into_data(envelope.method())
    }
}

fn first(data: &mut Vec<String>, method: Method) -> Result<String> {
    if data.is_empty() {
        return Err(SignerError::Rejected {
            method: method.name(),
            reason: "reply carried no data".to_string(),
        });
    }
    Ok(data.remove(0))
}
