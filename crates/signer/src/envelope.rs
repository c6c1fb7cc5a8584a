use std::sync::atomic::{AtomicI32, Ordering};

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::digest::hex_digest;
use crate::error::{Result, SignerError};

/// Correlation id reserved for the certificate request sent on connect.
pub const BOOTSTRAP_ID: i32 = 1;

/// U-Key password used when none is configured.
pub const DEFAULT_PASSWORD: &str = "88888888";

/// Hands out correlation ids for everything except the bootstrap request.
///
/// Starts right after [`BOOTSTRAP_ID`] and restarts there after `i32::MAX`, so
/// ids are unique among requests in flight, not over the process lifetime.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicI32,
}

impl RequestIds {
    const FIRST: i32 = BOOTSTRAP_ID + 1;

    pub fn new() -> Self {
        Self::starting_at(Self::FIRST)
    }

    fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicI32::new(first),
        }
    }

    pub fn next_id(&self) -> i32 {
        let step = |id: i32| Some(if id == i32::MAX { Self::FIRST } else { id + 1 });
        match self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, step) {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Operations understood by the customs U-Key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Returns the signing certificate held by the key.
    GetSignCert,
    /// SHA-1 digest of the source text, computed on the key.
    Sha1Digest,
    /// Sign raw source text; the key hashes it.
    SignData,
    /// Sign a caller-computed hex SHA-1 digest.
    SignDataNoHash,
    /// Verify a signature over a caller-computed hex SHA-1 digest.
    VerifySignDataNoHash,
}

impl Method {
    /// Wire name. These strings are fixed by the signer and must not change.
    pub const fn name(self) -> &'static str {
        match self {
            Method::GetSignCert => "cus-sec_SpcGetSignCertAsPEM",
            Method::Sha1Digest => "cus-sec_SpcSHA1DigestAsPEM",
            Method::SignData => "cus-sec_SpcSignDataAsPEM",
            Method::SignDataNoHash => "cus-sec_SpcSignDataNoHashAsPEM",
            Method::VerifySignDataNoHash => "cus-sec_SpcVerifySignDataNoHash",
        }
    }

    /// Argument keys in the order they go on the wire.
    pub const fn arg_order(self) -> &'static [&'static str] {
        match self {
            Method::GetSignCert => &[],
            Method::Sha1Digest => &["szInfo", "passwd"],
            Method::SignData | Method::SignDataNoHash => &["inData", "passwd"],
            Method::VerifySignDataNoHash => &["inData", "signData", "certDataPEM"],
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Named arguments of an envelope, serialized in insertion order.
///
/// Some signer builds are sensitive to key order, so this never goes
/// through a hashed or sorted map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<(&'static str, String)>);

impl Args {
    fn push(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.push((key, value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(k, _)| *k)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Args {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A single request to the U-Key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Envelope {
    #[serde(rename = "_method")]
    method: Method,
    #[serde(rename = "_id")]
    id: i32,
    args: Args,
}

impl Envelope {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Wire text of the envelope.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Source text to be signed, already canonicalized and stripped of its
/// signature node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub id: i32,
    pub source: String,
}

impl SignRequest {
    pub fn new(id: i32, source: impl Into<String>) -> Self {
        Self {
            id,
            source: source.into(),
        }
    }
}

/// Builds request envelopes for each U-Key operation.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    password: String,
}

impl Default for EnvelopeBuilder {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EnvelopeBuilder {
    /// Falls back to [`DEFAULT_PASSWORD`] when `password` is `None`.
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
        }
    }

    /// The bootstrap certificate request. Always carries [`BOOTSTRAP_ID`].
    pub fn certificate_request() -> Envelope {
        Envelope {
            method: Method::GetSignCert,
            id: BOOTSTRAP_ID,
            args: Args::default(),
        }
    }

    /// Digest computed by the key. `source` goes over unhashed.
    pub fn digest_request(&self, source: &str, id: i32) -> Result<Envelope> {
        check_id(id)?;
        check_text("source", source)?;

        let mut args = Args::default();
        args.push("szInfo", source);
        args.push("passwd", self.password.as_str());
        Ok(Envelope {
            method: Method::Sha1Digest,
            id,
            args,
        })
    }

    /// Sign where the key hashes the raw source itself.
    pub fn sign_with_hash_request(&self, request: &SignRequest) -> Result<Envelope> {
        check_id(request.id)?;
        check_text("source", &request.source)?;

        let mut args = Args::default();
        args.push("inData", request.source.as_str());
        args.push("passwd", self.password.as_str());
        Ok(Envelope {
            method: Method::SignData,
            id: request.id,
            args,
        })
    }

    /// Sign a locally computed digest. `inData` carries the hex SHA-1 of
    /// the source, never the source itself.
    pub fn sign_no_hash_request(&self, request: &SignRequest) -> Result<Envelope> {
        check_id(request.id)?;
        check_text("source", &request.source)?;

        let mut args = Args::default();
        args.push("inData", hex_digest(&request.source));
        args.push("passwd", self.password.as_str());
        Ok(Envelope {
            method: Method::SignDataNoHash,
            id: request.id,
            args,
        })
    }

    /// Verify `signature` over the hex SHA-1 of `source`.
    ///
    /// Without `certificate` the key verifies against the certificate it
    /// currently holds. A blank certificate counts as absent.
    pub fn verify_no_hash_request(
        &self,
        source: &str,
        signature: &str,
        certificate: Option<&str>,
        id: i32,
    ) -> Result<Envelope> {
        check_id(id)?;
        check_text("source", source)?;
        check_text("signature", signature)?;

        let mut args = Args::default();
        args.push("inData", hex_digest(source));
        args.push("signData", signature);
        if let Some(certificate) = certificate.filter(|c| !c.trim().is_empty()) {
            args.push("certDataPEM", certificate);
        }
        Ok(Envelope {
            method: Method::VerifySignDataNoHash,
            id,
            args,
        })
    }
}

fn check_id(id: i32) -> Result<()> {
    if id <= 0 {
        return Err(SignerError::InvalidArgument(format!(
            "correlation id must be positive, got {id}"
        )));
    }
    Ok(())
}

fn check_text(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SignerError::InvalidArgument(format!("{name} must not be empty")));
    }
    Ok(())
}
