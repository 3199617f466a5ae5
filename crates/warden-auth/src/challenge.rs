//! Per-connection challenge/response handshake.
//!
//! # Flow
//! ```text
//! open()                     respond(ConnectRequest)
//! AwaitingConnect ──► NonceIssued ──────────────────► Authenticated(Identity)
//!        │                         └────────────────► Rejected
//!        └──(auth not required)──► Authenticated(anonymous)
//! ```
//! The nonce travels to the client inside [`ServerHello`]. The client signs
//! the nonce text with its user key and returns the key and signature in a
//! [`ConnectRequest`]. Every failure maps to the same [`AuthFailure`].
//!
//! # Key invariants
//! - Outstanding nonces live in a process-wide [`Registry`]; issuance retries
//!   on collision, so no two open handshakes share a nonce.
//! - Verification removes the nonce before checking anything else. A nonce is
//!   therefore compared at most once, even when the attempt fails.
//! - Once `Authenticated`, the identity never changes for the life of the
//!   [`Challenge`].
use crate::errors::{AuthError, AuthFailure, AuthResult, RejectReason};
use crate::keys::{KeyPair, KeyRole, PublicKey, decode_signature};
use crate::nonce::generate_nonce;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warden_registry::Registry;

const VOUCH_DOMAIN: &[u8] = b"warden-vouch:v1\0";
const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When false every connection is admitted with an anonymous identity.
    pub auth_required: bool,
    /// User keys admitted without a vouch.
    pub allowed_keys: Vec<String>,
    /// Operator keys allowed to vouch for user keys.
    pub trusted_keys: Vec<String>,
    /// Maximum age of a nonce at verification time.
    pub nonce_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_required: true,
            allowed_keys: Vec::new(),
            trusted_keys: Vec::new(),
            nonce_ttl: DEFAULT_NONCE_TTL,
        }
    }
}

/// Operator keys validated at construction, kept verbatim and in order.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    raw: Vec<String>,
    keys: Vec<PublicKey>,
}

impl TrustedKeys {
    pub fn parse(keys: &[String]) -> AuthResult<Self> {
        let mut parsed = Vec::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            let public = PublicKey::parse_role(key, KeyRole::Operator).map_err(|source| {
                AuthError::InvalidTrustedKey {
                    index,
                    key: key.clone(),
                    source,
                }
            })?;
            parsed.push(public);
        }
        Ok(Self {
            raw: keys.to_vec(),
            keys: parsed,
        })
    }

    pub fn as_strings(&self) -> &[String] {
        &self.raw
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|trusted| trusted == key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Who a connection authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    public_key: Option<String>,
    account: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            public_key: None,
            account: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.public_key.is_none()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }
}

/// Operator statement that a user key belongs to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vouch {
    pub issuer: String,
    pub account: String,
    pub sig: String,
}

impl Vouch {
    pub fn issue(operator: &KeyPair, user: &PublicKey, account: &str) -> Self {
        let message = vouch_message(&user.to_text(), account);
        Self {
            issuer: operator.public_key().to_text(),
            account: account.to_string(),
            sig: operator.sign(&message),
        }
    }
}

fn vouch_message(user_key: &str, account: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(VOUCH_DOMAIN.len() + user_key.len() + account.len() + 1);
    message.extend_from_slice(VOUCH_DOMAIN);
    message.extend_from_slice(user_key.as_bytes());
    message.push(0);
    message.extend_from_slice(account.as_bytes());
    message
}

/// First message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub server_id: String,
    pub auth_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Client reply carrying the claimed identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vouch: Option<Vouch>,
}

impl ConnectRequest {
    /// Build a request that answers `nonce` with `user`'s key.
    pub fn signed(user: &KeyPair, nonce: &str) -> Self {
        Self {
            nkey: Some(user.public_key().to_text()),
            sig: Some(user.sign(nonce.as_bytes())),
            ..Self::default()
        }
    }

    pub fn with_vouch(mut self, vouch: Vouch) -> Self {
        self.vouch = Some(vouch);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingConnect,
    NonceIssued { nonce: String, issued_at: Instant },
    Authenticated(Identity),
    Rejected,
}

#[derive(Debug)]
struct IssuedNonce {
    conn_id: String,
    issued_at: Instant,
}

#[derive(Debug)]
struct AuthInner {
    auth_required: bool,
    allowed: HashSet<String>,
    trusted: TrustedKeys,
    nonce_ttl: Duration,
    server_id: String,
    outstanding: Registry<IssuedNonce>,
}

impl AuthInner {
    fn vouched_account(&self, user: &PublicKey, vouch: &Vouch) -> Option<String> {
        if vouch.account.is_empty() {
            return None;
        }
        let issuer = PublicKey::parse_role(&vouch.issuer, KeyRole::Operator).ok()?;
        if !self.trusted.contains(&issuer) {
            return None;
        }
        let message = vouch_message(&user.to_text(), &vouch.account);
        issuer
            .verify(&message, &vouch.sig)
            .then(|| vouch.account.clone())
    }
}

/// Shared handshake policy. Cheap to clone; one per server.
#[derive(Debug, Clone)]
pub struct Authenticator {
    inner: Arc<AuthInner>,
}

impl Authenticator {
    /// Validate the configured keys and build the authenticator.
    ///
    /// Any malformed trusted or allowed key fails construction; nothing is
    /// deferred to the first connection.
    pub fn new(config: AuthConfig, server_key: &KeyPair) -> AuthResult<Self> {
        let trusted = TrustedKeys::parse(&config.trusted_keys)?;
        let mut allowed = HashSet::with_capacity(config.allowed_keys.len());
        for (index, key) in config.allowed_keys.iter().enumerate() {
            let public = PublicKey::parse_role(key, KeyRole::User).map_err(|source| {
                AuthError::InvalidAllowedKey {
                    index,
                    key: key.clone(),
                    source,
                }
            })?;
            allowed.insert(public.to_text());
        }
        Ok(Self {
            inner: Arc::new(AuthInner {
                auth_required: config.auth_required,
                allowed,
                trusted,
                nonce_ttl: config.nonce_ttl,
                server_id: server_key.public_key().to_text(),
                outstanding: Registry::new(),
            }),
        })
    }

    /// Start the handshake for a freshly accepted connection.
    pub fn open(&self, conn_id: impl Into<String>) -> Challenge {
        let conn_id = conn_id.into();
        let mut challenge = Challenge {
            inner: Arc::clone(&self.inner),
            hello: ServerHello {
                server_id: self.inner.server_id.clone(),
                auth_required: self.inner.auth_required,
                nonce: None,
            },
            conn_id,
            state: HandshakeState::AwaitingConnect,
        };
        if self.inner.auth_required {
            challenge.issue_nonce();
        } else {
            challenge.state = HandshakeState::Authenticated(Identity::anonymous());
        }
        challenge
    }

    pub fn auth_required(&self) -> bool {
        self.inner.auth_required
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn trusted_keys(&self) -> &TrustedKeys {
        &self.inner.trusted
    }

    /// Number of nonces issued and not yet consumed or abandoned.
    pub fn outstanding_nonces(&self) -> usize {
        self.inner.outstanding.len()
    }
}

/// One connection's handshake. Dropping it abandons any unanswered nonce.
#[derive(Debug)]
pub struct Challenge {
    inner: Arc<AuthInner>,
    conn_id: String,
    hello: ServerHello,
    state: HandshakeState,
}

impl Challenge {
    fn issue_nonce(&mut self) {
        let issued_at = Instant::now();
        let nonce = loop {
            let candidate = generate_nonce();
            let issued = IssuedNonce {
                conn_id: self.conn_id.clone(),
                issued_at,
            };
            if self.inner.outstanding.add(candidate.clone(), issued) {
                break candidate;
            }
            tracing::warn!(conn_id = %self.conn_id, "nonce collision, regenerating");
        };
        self.hello.nonce = Some(nonce.clone());
        self.state = HandshakeState::NonceIssued { nonce, issued_at };
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Payload for the server's initial handshake message.
    pub fn hello(&self) -> &ServerHello {
        &self.hello
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            HandshakeState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    /// Verify the client's reply and move to a terminal state.
    pub fn respond(&mut self, request: &ConnectRequest) -> Result<Identity, AuthFailure> {
        match std::mem::replace(&mut self.state, HandshakeState::Rejected) {
            HandshakeState::NonceIssued { nonce, .. } => match self.verify(&nonce, request) {
                Ok(identity) => {
                    self.state = HandshakeState::Authenticated(identity.clone());
                    Ok(identity)
                }
                Err(reason) => Err(AuthFailure::new(reason)),
            },
            HandshakeState::Authenticated(identity) => {
                let outcome = if identity.is_anonymous() {
                    Ok(identity.clone())
                } else {
                    Err(AuthFailure::new(RejectReason::AlreadyBound))
                };
                self.state = HandshakeState::Authenticated(identity);
                outcome
            }
            HandshakeState::Rejected => Err(AuthFailure::new(RejectReason::AlreadyRejected)),
            HandshakeState::AwaitingConnect => {
                Err(AuthFailure::new(RejectReason::MissingCredentials))
            }
        }
    }

    fn verify(&self, nonce: &str, request: &ConnectRequest) -> Result<Identity, RejectReason> {
        let issued = match self.inner.outstanding.take(nonce) {
            Some(issued) if issued.conn_id == self.conn_id => issued,
            _ => return Err(RejectReason::NonceReused),
        };
        if issued.issued_at.elapsed() > self.inner.nonce_ttl {
            return Err(RejectReason::StaleNonce);
        }
        let (Some(nkey), Some(sig)) = (&request.nkey, &request.sig) else {
            return Err(RejectReason::MissingCredentials);
        };
        let key = PublicKey::parse_role(nkey, KeyRole::User)
            .map_err(|_| RejectReason::MalformedKey)?;
        let signature = decode_signature(sig).ok_or(RejectReason::MalformedSignature)?;
        if !key.verify_signature(nonce.as_bytes(), &signature) {
            return Err(RejectReason::BadSignature);
        }

        // A presented vouch must verify even when the key is allow-listed.
        let account = match &request.vouch {
            Some(vouch) => Some(
                self.inner
                    .vouched_account(&key, vouch)
                    .ok_or(RejectReason::UntrustedVouch)?,
            ),
            None => None,
        };
        if account.is_none() && !self.inner.allowed.contains(&key.to_text()) {
            return Err(RejectReason::UnknownKey);
        }
        Ok(Identity {
            public_key: Some(key.to_text()),
            account,
        })
    }
}

impl Drop for Challenge {
    fn drop(&mut self) {
        if let HandshakeState::NonceIssued { nonce, .. } = &self.state {
            self.inner.outstanding.delete(nonce);
        }
    }
}
