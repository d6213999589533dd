use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),

    #[error("invalid certificate")]
    InvalidCertificate,

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("handshake payload too large: {len} bytes (max: {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("handshake frame length mismatch: declared {declared}, read {actual}")]
    FrameLengthMismatch { declared: usize, actual: usize },

    #[error("challenge handshake failed")]
    ChallengeFailed,

    #[error("challenge handshake timed out")]
    ChallengeTimeout,

    #[error("connection denied by access control")]
    AccessDenied,

    #[error("peer {0} is not connected")]
    PeerNotConnected(String),
}

impl Error {
    /// A violation of the handshake wire protocol, as opposed to a transport
    /// failure. Violations are fatal to the one handshaking connection and are
    /// logged, but never propagate out of the accept pipeline.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::FrameTooLarge { .. }
                | Error::FrameLengthMismatch { .. }
                | Error::Json(_)
                | Error::ChallengeFailed
        )
    }
}
