pub mod bridge;
pub mod certificate;
pub mod config;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod response;
pub mod signature;

pub use bridge::{BridgeState, SignerBridge, WaitOutcome};
pub use certificate::{CertificateStore, SignMethod, strip_pem_markers};
pub use config::SignerConfig;
pub use digest::hex_digest;
pub use envelope::{BOOTSTRAP_ID, Envelope, EnvelopeBuilder, Method, RequestIds, SignRequest};
pub use error::{Result, SignerError};
pub use response::SignerResponse;
pub use signature::{Signature, SignatureClient};
