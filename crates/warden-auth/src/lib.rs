//! Connection authentication for the Warden broker.
//!
//! # Purpose
//! Binds each inbound connection to an Ed25519 public key through a
//! nonce challenge, or admits it anonymously when the server does not
//! require identity.
//!
//! # How it fits
//! The broker builds one [`Authenticator`] at startup from configuration.
//! Construction validates every trusted and allowed key, so a malformed key
//! stops the process before any listener opens. Each accepted connection
//! calls [`Authenticator::open`], sends the resulting [`ServerHello`], and
//! feeds the client's [`ConnectRequest`] to [`Challenge::respond`].
//!
//! # Key invariants
//! - Nonces are single use and unique among open handshakes.
//! - Clients see one generic rejection regardless of cause.
//! - Allow-listed user keys and operator-vouched user keys are the only
//!   identities admitted when auth is required.
//!
//! # Examples
//! ```rust
//! use warden_auth::{AuthConfig, Authenticator, ConnectRequest, KeyPair, KeyRole};
//!
//! let server = KeyPair::generate(KeyRole::Operator);
//! let user = KeyPair::generate(KeyRole::User);
//! let auth = Authenticator::new(
//!     AuthConfig {
//!         allowed_keys: vec![user.public_key().to_text()],
//!         ..AuthConfig::default()
//!     },
//!     &server,
//! )
//! .expect("config");
//!
//! let mut challenge = auth.open("conn-1");
//! let nonce = challenge.hello().nonce.clone().expect("nonce");
//! let identity = challenge
//!     .respond(&ConnectRequest::signed(&user, &nonce))
//!     .expect("authenticated");
//! assert!(!identity.is_anonymous());
//! ```
mod challenge;
mod errors;
mod keys;
mod nonce;

pub use challenge::{
    AuthConfig, Authenticator, Challenge, ConnectRequest, HandshakeState, Identity, ServerHello,
    TrustedKeys, Vouch,
};
pub use errors::{AuthError, AuthFailure, AuthResult, KeyError, RejectReason};
pub use keys::{KeyPair, KeyRole, KeySource, ProductionKeySource, PublicKey, TestFixtureKeySource};
pub use nonce::{NONCE_LEN, generate_nonce};
