// Handshake nonce generation.
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;

/// Raw nonce length in bytes before encoding.
pub const NONCE_LEN: usize = 24;

/// Generate an unpredictable nonce as base64url text (32 characters).
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
