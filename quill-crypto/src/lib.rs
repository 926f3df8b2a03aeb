use anyhow::{anyhow, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub const KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// An Ed25519 keypair as raw bytes.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub public_key: [u8; KEY_LENGTH],
    pub secret_key: [u8; KEY_LENGTH],
}

pub fn generate_keypair() -> KeyMaterial {
    let mut csprng = OsRng;
    let signing = SigningKey::generate(&mut csprng);
    KeyMaterial {
        public_key: signing.verifying_key().to_bytes(),
        secret_key: signing.to_bytes(),
    }
}

/// Derive the public key from a secret key.
pub fn public_key_from_secret(secret: &[u8; KEY_LENGTH]) -> [u8; KEY_LENGTH] {
    SigningKey::from_bytes(secret).verifying_key().to_bytes()
}

/// Sign a message. Returns the 64-byte signature.
pub fn sign_message(secret: &[u8; KEY_LENGTH], message: &[u8]) -> Vec<u8> {
    let signing = SigningKey::from_bytes(secret);
    signing.sign(message).to_bytes().to_vec()
}

/// Verify an Ed25519 signature. Malformed keys or signatures verify as
/// false; this never errors out to callers.
pub fn verify_signature(public: &[u8; KEY_LENGTH], message: &[u8], signature: &[u8]) -> bool {
    let verifying = match VerifyingKey::from_bytes(public) {
        Ok(vk) => vk,
        Err(_) => return false,
    };
    let sig_bytes: [u8; SIGNATURE_LENGTH] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    verifying
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Parse a hex-encoded 32-byte secret key (the key-file format).
pub fn secret_key_from_hex(text: &str) -> Result<[u8; KEY_LENGTH]> {
    let bytes = hex::decode(text.trim())?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("secret key must be {KEY_LENGTH} bytes"))
}
