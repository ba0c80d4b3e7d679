use rand::RngCore;
use sha2::{Digest, Sha256};

/// 12 random bytes rendered as lowercase hex, prefixed `ag_`. Collisions are
/// astronomically unlikely; the caller treats an `AlreadyExists` from
/// `Store::create` as a signal to retry with a freshly minted id rather
/// than handling it here.
pub fn generate_agent_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ag_{}", hex::encode(bytes))
}

/// 32 random bytes rendered as lowercase hex, prefixed `ocb_`. Presented by
/// clients as `Authorization: Bearer <token>`; never persisted in plaintext.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ocb_{}", hex::encode(bytes))
}

/// SHA-256 of the presented token, hex-encoded. The only form of a token
/// ever written to a store.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
