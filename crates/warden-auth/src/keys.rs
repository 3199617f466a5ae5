//! Ed25519 identities in nkey text form.
//!
//! # Format
//! ```text
//! public: <role><base64url_no_pad(key[32] || checksum[4])>
//! seed:   S<role><base64url_no_pad(seed[32] || checksum[4])>
//! ```
//! `role` is `U` (user), `A` (account) or `O` (operator). The checksum is the
//! first four bytes of SHA-256 over the prefix bytes followed by the key
//! bytes, so a key typed with the wrong role letter fails to parse.
//!
//! # Security
//! Seeds are private key material. [`KeyPair`] deliberately has no `Debug`
//! output for the seed and must never be logged.
use crate::errors::{AuthError, AuthResult, KeyError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

const KEY_LEN: usize = 32;
const CHECKSUM_LEN: usize = 4;
const SEED_PREFIX: char = 'S';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    User,
    Account,
    Operator,
}

impl KeyRole {
    pub fn prefix(&self) -> char {
        match self {
            Self::User => 'U',
            Self::Account => 'A',
            Self::Operator => 'O',
        }
    }

    fn from_prefix(prefix: char) -> Result<Self, KeyError> {
        match prefix {
            'U' => Ok(Self::User),
            'A' => Ok(Self::Account),
            'O' => Ok(Self::Operator),
            other => Err(KeyError::UnknownPrefix(other)),
        }
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Account => "account",
            Self::Operator => "operator",
        };
        f.write_str(name)
    }
}

fn checksum(prefix: &str, key: &[u8; KEY_LEN]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(key);
    let digest = hasher.finalize();
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

fn encode(prefix: &str, key: &[u8; KEY_LEN]) -> String {
    let mut payload = Vec::with_capacity(KEY_LEN + CHECKSUM_LEN);
    payload.extend_from_slice(key);
    payload.extend_from_slice(&checksum(prefix, key));
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(payload))
}

fn decode(prefix: &str, body: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let payload = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|_| KeyError::Encoding)?;
    if payload.len() != KEY_LEN + CHECKSUM_LEN {
        return Err(KeyError::Length(payload.len()));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&payload[..KEY_LEN]);
    if payload[KEY_LEN..] != checksum(prefix, &key) {
        return Err(KeyError::Checksum);
    }
    Ok(key)
}

/// A parsed, curve-validated public key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    role: KeyRole,
    key: VerifyingKey,
}

impl PublicKey {
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        let mut chars = text.chars();
        let prefix = chars.next().ok_or(KeyError::Empty)?;
        let role = KeyRole::from_prefix(prefix)?;
        let bytes = decode(&prefix.to_string(), chars.as_str())?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPoint)?;
        Ok(Self { role, key })
    }

    /// Parse and require a specific role.
    pub fn parse_role(text: &str, expected: KeyRole) -> Result<Self, KeyError> {
        let key = Self::parse(text)?;
        if key.role != expected {
            return Err(KeyError::RoleMismatch {
                expected,
                actual: key.role,
            });
        }
        Ok(key)
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    /// Check a detached base64url signature over `message`.
    ///
    /// Malformed signatures and failed verification both return `false`.
    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        decode_signature(signature)
            .map(|sig| self.key.verify_strict(message, &sig).is_ok())
            .unwrap_or(false)
    }

    pub(crate) fn verify_signature(&self, message: &[u8], signature: &Signature) -> bool {
        self.key.verify_strict(message, signature).is_ok()
    }

    pub fn to_text(&self) -> String {
        encode(&self.role.prefix().to_string(), self.key.as_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_text()).finish()
    }
}

pub(crate) fn decode_signature(text: &str) -> Option<Signature> {
    let bytes = URL_SAFE_NO_PAD.decode(text).ok()?;
    Signature::from_slice(&bytes).ok()
}

/// Signing key pair for one role.
#[derive(Clone)]
pub struct KeyPair {
    role: KeyRole,
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS-seeded thread RNG.
    pub fn generate(role: KeyRole) -> Self {
        let mut seed = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_raw_seed(role, seed)
    }

    pub fn from_raw_seed(role: KeyRole, seed: [u8; KEY_LEN]) -> Self {
        Self {
            role,
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_seed(text: &str) -> Result<Self, KeyError> {
        let mut chars = text.trim().chars();
        match chars.next() {
            None => return Err(KeyError::Empty),
            Some(SEED_PREFIX) => {}
            Some(other) => return Err(KeyError::UnknownPrefix(other)),
        }
        let role_prefix = chars.next().ok_or(KeyError::Empty)?;
        let role = KeyRole::from_prefix(role_prefix)?;
        let prefix = format!("{SEED_PREFIX}{role_prefix}");
        let seed = decode(&prefix, chars.as_str())?;
        Ok(Self::from_raw_seed(role, seed))
    }

    pub fn seed_text(&self) -> String {
        let prefix = format!("{SEED_PREFIX}{}", self.role.prefix());
        encode(&prefix, self.signing.as_bytes())
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            role: self.role,
            key: self.signing.verifying_key(),
        }
    }

    /// Sign `message`, returning the signature as base64url without padding.
    pub fn sign(&self, message: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.signing.sign(message).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("role", &self.role)
            .field("public_key", &self.public_key().to_text())
            .finish_non_exhaustive()
    }
}

/// Where the server's own key pair comes from.
///
/// Production and test material never share a code path: fixtures carry an
/// explicit deterministic seed, production keys come from disk or the RNG.
#[derive(Debug, Clone)]
pub enum KeySource {
    Production(ProductionKeySource),
    TestFixture(TestFixtureKeySource),
}

#[derive(Debug, Clone, Default)]
pub struct ProductionKeySource {
    /// Seed file in `S<role>...` form. `None` generates an ephemeral key.
    pub seed_file: Option<PathBuf>,
}

#[derive(Clone)]
pub struct TestFixtureKeySource {
    pub seed: [u8; KEY_LEN],
}

impl fmt::Debug for TestFixtureKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFixtureKeySource").finish_non_exhaustive()
    }
}

impl KeySource {
    pub fn load(&self, role: KeyRole) -> AuthResult<KeyPair> {
        match self {
            Self::Production(source) => match &source.seed_file {
                Some(path) => {
                    let text =
                        std::fs::read_to_string(path).map_err(|source| AuthError::SeedFile {
                            path: path.clone(),
                            source,
                        })?;
                    let pair = KeyPair::from_seed(&text).map_err(AuthError::InvalidSeed)?;
                    if pair.role() != role {
                        return Err(AuthError::InvalidSeed(KeyError::RoleMismatch {
                            expected: role,
                            actual: pair.role(),
                        }));
                    }
                    Ok(pair)
                }
                None => Ok(KeyPair::generate(role)),
            },
            Self::TestFixture(fixture) => Ok(KeyPair::from_raw_seed(role, fixture.seed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_text_round_trips() {
        let pair = KeyPair::generate(KeyRole::User);
        let text = pair.public_key().to_text();
        assert!(text.starts_with('U'));
        assert_eq!(text.len(), 49);
        let parsed = PublicKey::parse(&text).expect("parse");
        assert_eq!(parsed, pair.public_key());
    }

    #[test]
    fn seed_text_round_trips() {
        let pair = KeyPair::generate(KeyRole::Operator);
        let seed = pair.seed_text();
        assert!(seed.starts_with("SO"));
        let restored = KeyPair::from_seed(&seed).expect("seed");
        assert_eq!(restored.public_key(), pair.public_key());
    }

    #[test]
    fn parse_rejects_wrong_prefix_letter() {
        let text = KeyPair::generate(KeyRole::User).public_key().to_text();
        let swapped = format!("A{}", &text[1..]);
        assert_eq!(PublicKey::parse(&swapped), Err(KeyError::Checksum));
        assert_eq!(
            PublicKey::parse(&format!("X{}", &text[1..])),
            Err(KeyError::UnknownPrefix('X'))
        );
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert_eq!(PublicKey::parse(""), Err(KeyError::Empty));
        assert_eq!(PublicKey::parse("U!!!"), Err(KeyError::Encoding));
        assert_eq!(PublicKey::parse("UAAAA"), Err(KeyError::Length(3)));
    }

    #[test]
    fn parse_role_enforces_expected_role() {
        let text = KeyPair::generate(KeyRole::User).public_key().to_text();
        let err = PublicKey::parse_role(&text, KeyRole::Operator).expect_err("role");
        assert_eq!(
            err,
            KeyError::RoleMismatch {
                expected: KeyRole::Operator,
                actual: KeyRole::User
            }
        );
    }

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::generate(KeyRole::User);
        let sig = pair.sign(b"nonce");
        assert!(pair.public_key().verify(b"nonce", &sig));
        assert!(!pair.public_key().verify(b"other", &sig));
        assert!(!pair.public_key().verify(b"nonce", "not-a-signature"));
    }

    #[test]
    fn fixture_source_is_deterministic() {
        let source = KeySource::TestFixture(TestFixtureKeySource { seed: [9u8; 32] });
        let a = source.load(KeyRole::Operator).expect("load");
        let b = source.load(KeyRole::Operator).expect("load");
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn production_source_without_file_generates_fresh_keys() {
        let source = KeySource::Production(ProductionKeySource::default());
        let a = source.load(KeyRole::Operator).expect("load");
        let b = source.load(KeyRole::Operator).expect("load");
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn production_source_reports_missing_file() {
        let source = KeySource::Production(ProductionKeySource {
            seed_file: Some(PathBuf::from("/nonexistent/warden/seed")),
        });
        let err = source.load(KeyRole::Operator).expect_err("missing");
        assert!(matches!(err, AuthError::SeedFile { .. }));
    }

    #[test]
    fn production_source_rejects_role_mismatch() {
        let path = std::env::temp_dir().join(format!("warden-seed-{}", std::process::id()));
        std::fs::write(&path, KeyPair::generate(KeyRole::User).seed_text()).expect("write");
        let source = KeySource::Production(ProductionKeySource {
            seed_file: Some(path.clone()),
        });
        let err = source.load(KeyRole::Operator).expect_err("role");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            err,
            AuthError::InvalidSeed(KeyError::RoleMismatch { .. })
        ));
    }
}
