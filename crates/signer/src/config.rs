use std::path::PathBuf;
use std::time::Duration;

use crate::envelope::EnvelopeBuilder;

/// Local endpoint the customs U-Key client listens on.
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:61232";

/// Ceiling on the bootstrap certificate wait.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only settings for talking to the U-Key.
#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub ws_url: String,
    /// `None` means the key's factory default password.
    pub password: Option<String>,
    /// Bundled certificate for the with-hash signing method.
    pub cert_path: Option<PathBuf>,
    pub bootstrap_timeout: Duration,
    /// Ceiling for each digest/sign/verify round trip.
    pub call_timeout: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            password: None,
            cert_path: None,
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl SignerConfig {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            ..Self::default()
        }
    }

    pub fn envelope_builder(&self) -> EnvelopeBuilder {
        EnvelopeBuilder::new(self.password.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DEFAULT_PASSWORD;

    #[test]
    fn defaults_point_at_local_ukey() {
        let config = SignerConfig::default();
        assert_eq!(config.ws_url, "ws://127.0.0.1:61232");
        assert_eq!(config.bootstrap_timeout, Duration::from_secs(3));
        assert!(config.cert_path.is_none());
    }

    #[test]
    fn builder_uses_configured_password() {
        let mut config = SignerConfig::new("ws://127.0.0.1:1");
        let envelope = config.envelope_builder().digest_request("x", 2).unwrap();
        assert_eq!(envelope.args().get("passwd"), Some(DEFAULT_PASSWORD));

        config.password = Some("11111111".into());
        let envelope = config.envelope_builder().digest_request("x", 2).unwrap();
        assert_eq!(envelope.args().get("passwd"), Some("11111111"));
    }
}
