use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use crate::envelope::Method;
use crate::error::{Result, SignerError};

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Which signing method a stored certificate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignMethod {
    /// Certificate for signatures the key hashes itself. Loaded from the
    /// bundled certificate file.
    WithHash,
    /// Certificate for signatures over a caller-computed digest. Taken from
    /// the key's answer to the bootstrap request.
    WithoutHash,
}

impl SignMethod {
    pub fn method(self) -> Method {
        match self {
            SignMethod::WithHash => Method::SignData,
            SignMethod::WithoutHash => Method::SignDataNoHash,
        }
    }
}

impl std::fmt::Display for SignMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignMethod::WithHash => f.write_str("with-hash"),
            SignMethod::WithoutHash => f.write_str("without-hash"),
        }
    }
}

/// Removes the PEM header and footer lines, leaving the base64 body.
///
/// Input without markers comes back unchanged.
pub fn strip_pem_markers(raw: &str) -> String {
    let mut body = raw;
    if let Some(start) = body.find(PEM_BEGIN) {
        body = &body[start + PEM_BEGIN.len()..];
        body = body
            .strip_prefix("\r\n")
            .or_else(|| body.strip_prefix('\n'))
            .unwrap_or(body);
    }
    if let Some(end) = body.find(PEM_END) {
        body = &body[..end];
        body = body
            .strip_suffix("\r\n")
            .or_else(|| body.strip_suffix('\n'))
            .unwrap_or(body);
    }
    body.to_string()
}

/// Certificate bodies keyed by signing method.
///
/// Populated at startup from the bundled file and from the bootstrap
/// handshake; entries are never removed. Share it as `Arc<CertificateStore>`.
#[derive(Debug, Default)]
pub struct CertificateStore {
    entries: RwLock<HashMap<SignMethod, String>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins.
    pub(crate) fn put(&self, kind: SignMethod, body: impl Into<String>) {
        let body = body.into();
        debug!(%kind, len = body.len(), "storing certificate");
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, body);
    }

    pub fn get(&self, kind: SignMethod) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .cloned()
    }

    /// Like [`get`](Self::get), but absence is a hard error.
    pub fn require(&self, kind: SignMethod) -> Result<String> {
        self.get(kind).ok_or(SignerError::MissingCertificate(kind))
    }

    /// DER bytes of a stored certificate.
    pub fn der(&self, kind: SignMethod) -> Result<Vec<u8>> {
        let body = self.require(kind)?;
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD
            .decode(compact)
            .map_err(|e| SignerError::Certificate(e.to_string()))
    }

    /// Reads the bundled PEM file into the [`SignMethod::WithHash`] slot.
    ///
    /// Returns `false` when the file does not exist.
    pub fn load_bundled(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "bundled certificate file not found");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        self.put(SignMethod::WithHash, strip_pem_markers(&raw));
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashMap<SignMethod, String> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    const BODY: &str = "MIIBszCCAVmgAwIBAgIU\nQ0VSVElGSUNBVEU=";

    fn pem(body: &str) -> String {
        format!("{PEM_BEGIN}\n{body}\n{PEM_END}\n")
    }

    #[test]
    fn strips_markers_and_adjoining_newlines() {
        assert_eq!(strip_pem_markers(&pem(BODY)), BODY);
    }

    #[test]
    fn strips_crlf_markers() {
        let raw = format!("{PEM_BEGIN}\r\n{BODY}\r\n{PEM_END}\r\n");
        assert_eq!(strip_pem_markers(&raw), BODY);
    }

    #[test]
    fn stripping_is_idempotent() {
        let once = strip_pem_markers(&pem(BODY));
        assert_eq!(strip_pem_markers(&once), once);
        assert_eq!(strip_pem_markers("AAAA"), "AAAA");
    }

    #[test]
    fn get_is_absent_until_put() {
        let store = CertificateStore::new();
        assert_eq!(store.get(SignMethod::WithoutHash), None);
        assert!(store.is_empty());

        store.put(SignMethod::WithoutHash, "BBBB");
        assert_eq!(store.get(SignMethod::WithoutHash).as_deref(), Some("BBBB"));
        assert_eq!(store.get(SignMethod::WithHash), None);
    }

    #[test]
    fn put_last_write_wins() {
        let store = CertificateStore::new();
        store.put(SignMethod::WithHash, "AAAA");
        store.put(SignMethod::WithHash, "CCCC");
        assert_eq!(store.get(SignMethod::WithHash).as_deref(), Some("CCCC"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn require_reports_missing_kind() {
        let store = CertificateStore::new();
        let error = store.require(SignMethod::WithHash).unwrap_err();
        assert!(matches!(error, SignerError::MissingCertificate(SignMethod::WithHash)));
    }

    #[test]
    fn der_decodes_multiline_body() {
        let store = CertificateStore::new();
        store.put(SignMethod::WithHash, "AAEC\nAwQF");
        assert_eq!(store.der(SignMethod::WithHash).unwrap(), vec![0, 1, 2, 3, 4, 5]);

        store.put(SignMethod::WithoutHash, "not base64!");
        assert!(matches!(
            store.der(SignMethod::WithoutHash),
            Err(SignerError::Certificate(_))
        ));
    }

    #[test]
    fn load_bundled_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(pem("AAAA").as_bytes()).unwrap();

        let store = CertificateStore::new();
        assert!(store.load_bundled(file.path()).unwrap());
        assert_eq!(store.get(SignMethod::WithHash).as_deref(), Some("AAAA"));
    }

    #[test]
    fn load_bundled_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new();
        assert!(!store.load_bundled(dir.path().join("absent.cer")).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_readers_never_see_partial_values() {
        let store = Arc::new(CertificateStore::new());
        let long = "B".repeat(64 * 1024);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let expected = long.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(body) = store.get(SignMethod::WithoutHash) {
                            assert_eq!(body, expected);
                        }
                    }
                })
            })
            .collect();

        store.put(SignMethod::WithoutHash, long.clone());
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.get(SignMethod::WithoutHash), Some(long));
    }
}
