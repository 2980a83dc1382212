use crate::types::{Nonce, TxId};

/// Computes BLAKE3 and returns the first-class 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Derives a transaction id as `H(nonce || creator)`.
///
/// The same nonce/creator pair always yields the same id, so the id can be
/// recomputed by anyone holding the signature header.
pub fn derive_tx_id(nonce: &Nonce, creator: &[u8]) -> TxId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(nonce);
    hasher.update(creator);
    *hasher.finalize().as_bytes()
}

/// Lowercase hex rendering used in logs.
pub fn tx_id_hex(tx_id: &TxId) -> String {
    hex::encode(tx_id)
}
