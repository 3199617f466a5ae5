use crate::keys::KeyRole;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Syntactic problems with an nkey or seed string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,
    #[error("unknown key prefix {0:?}")]
    UnknownPrefix(char),
    #[error("key is not valid base64url")]
    Encoding,
    #[error("decoded key has length {0}, expected 36")]
    Length(usize),
    #[error("key checksum mismatch")]
    Checksum,
    #[error("key is not a valid ed25519 point")]
    InvalidPoint,
    #[error("expected {expected} key, got {actual} key")]
    RoleMismatch { expected: KeyRole, actual: KeyRole },
}

/// Construction-time failures. These abort startup.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid trusted key #{index} ({key}): {source}")]
    InvalidTrustedKey {
        index: usize,
        key: String,
        #[source]
        source: KeyError,
    },
    #[error("invalid allowed key #{index} ({key}): {source}")]
    InvalidAllowedKey {
        index: usize,
        key: String,
        #[source]
        source: KeyError,
    },
    #[error("invalid seed: {0}")]
    InvalidSeed(#[source] KeyError),
    #[error("read seed file {path}: {source}")]
    SeedFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Why a handshake was rejected. Server-side only; never sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingCredentials,
    MalformedKey,
    MalformedSignature,
    BadSignature,
    UnknownKey,
    UntrustedVouch,
    NonceReused,
    StaleNonce,
    AlreadyBound,
    AlreadyRejected,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::MalformedKey => "malformed_key",
            Self::MalformedSignature => "malformed_signature",
            Self::BadSignature => "bad_signature",
            Self::UnknownKey => "unknown_key",
            Self::UntrustedVouch => "untrusted_vouch",
            Self::NonceReused => "nonce_reused",
            Self::StaleNonce => "stale_nonce",
            Self::AlreadyBound => "already_bound",
            Self::AlreadyRejected => "already_rejected",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform handshake rejection.
///
/// `Display` is the same for every cause so nothing distinguishing reaches
/// the client. Use [`AuthFailure::reason`] for server-side logs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("authorization violation")]
pub struct AuthFailure {
    reason: RejectReason,
}

impl AuthFailure {
    pub(crate) fn new(reason: RejectReason) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> RejectReason {
        self.reason
    }
}
