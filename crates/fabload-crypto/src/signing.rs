use ed25519_dalek::Signer as DalekSignerTrait;
use k256::ecdsa::signature::{Signer as EcdsaSignerTrait, Verifier as EcdsaVerifierTrait};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by signing/verification helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigningError {
    /// Secret key bytes are not valid for the selected algorithm.
    #[error("invalid secret key bytes")]
    InvalidSecretKey,
    /// Pubkey bytes are not a valid verifying key.
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    /// The signing backend refused to produce a signature.
    #[error("signing failed")]
    SignFailed,
}

/// Signing capability shared read-only by every concurrent pipeline stage.
///
/// Implementations must be safe to call from many tasks at once.
pub trait Signer: Send + Sync {
    /// Signs `msg` and returns the encoded signature.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SigningError>;
    /// Returns the serialized creator identity embedded in signed messages.
    fn identity(&self) -> &[u8];
}

/// Signature scheme used for proposals and envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAlgorithm {
    /// ECDSA over secp256k1 with SHA-256, DER encoded, low-S normalized.
    #[default]
    Ecdsa,
    /// Ed25519, 64-byte raw signature.
    Ed25519,
}

/// Raw signing key for one of the supported algorithms.
#[derive(Clone)]
pub enum SigningKey {
    Ecdsa(k256::ecdsa::SigningKey),
    Ed25519(ed25519_dalek::SigningKey),
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm())
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

impl SigningKey {
    /// Creates a key from a 32-byte secret scalar / seed.
    pub fn from_secret(algorithm: SigningAlgorithm, secret: [u8; 32]) -> Result<Self, SigningError> {
        match algorithm {
            SigningAlgorithm::Ecdsa => k256::ecdsa::SigningKey::from_slice(&secret)
                .map(SigningKey::Ecdsa)
                .map_err(|_| SigningError::InvalidSecretKey),
            SigningAlgorithm::Ed25519 => Ok(SigningKey::Ed25519(
                ed25519_dalek::SigningKey::from_bytes(&secret),
            )),
        }
    }

    /// Generates a fresh random key.
    pub fn generate(algorithm: SigningAlgorithm) -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut secret = [0_u8; 32];
            rng.fill_bytes(&mut secret);
            // A uniformly random scalar is out of range with negligible probability.
            if let Ok(key) = Self::from_secret(algorithm, secret) {
                return key;
            }
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        match self {
            SigningKey::Ecdsa(_) => SigningAlgorithm::Ecdsa,
            SigningKey::Ed25519(_) => SigningAlgorithm::Ed25519,
        }
    }

    /// Public key bytes: SEC1 compressed point for ECDSA, raw 32 bytes for Ed25519.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            SigningKey::Ecdsa(key) => key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
            SigningKey::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self {
            SigningKey::Ecdsa(key) => {
                let signature: k256::ecdsa::Signature =
                    key.try_sign(msg).map_err(|_| SigningError::SignFailed)?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            SigningKey::Ed25519(key) => Ok(key.sign(msg).to_bytes().to_vec()),
        }
    }
}

/// Verifies `sig` over `msg` against `public_key` as produced by [`SigningKey`].
pub fn verify(
    algorithm: SigningAlgorithm,
    public_key: &[u8],
    msg: &[u8],
    sig: &[u8],
) -> Result<bool, SigningError> {
    match algorithm {
        SigningAlgorithm::Ecdsa => {
            let verifying_key = k256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| SigningError::InvalidPublicKey)?;
            let Ok(signature) = k256::ecdsa::Signature::from_der(sig) else {
                return Ok(false);
            };
            Ok(verifying_key.verify(msg, &signature).is_ok())
        }
        SigningAlgorithm::Ed25519 => {
            let pubkey = <[u8; 32]>::try_from(public_key)
                .map_err(|_| SigningError::InvalidPublicKey)?;
            let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&pubkey)
                .map_err(|_| SigningError::InvalidPublicKey)?;
            let Ok(sig) = <[u8; 64]>::try_from(sig) else {
                return Ok(false);
            };
            let signature = ed25519_dalek::Signature::from_bytes(&sig);
            Ok(verifying_key.verify_strict(msg, &signature).is_ok())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{verify, SigningAlgorithm, SigningError, SigningKey};

    #[test]
    fn ecdsa_sign_and_verify_round_trip() {
        let key = SigningKey::from_secret(SigningAlgorithm::Ecdsa, [0x42_u8; 32])
            .expect("valid scalar");
        let msg = b"fabload signed proposal";

        let signature = key.sign(msg).expect("sign should succeed");
        let ok = verify(SigningAlgorithm::Ecdsa, &key.public_key(), msg, &signature)
            .expect("verify should run");
        assert!(ok);
        assert_eq!(key.public_key().len(), 33);
    }

    #[test]
    fn ecdsa_signatures_are_low_s_der() {
        let key = SigningKey::generate(SigningAlgorithm::Ecdsa);
        for i in 0..16_u8 {
            let der = key.sign(&[i; 8]).expect("sign should succeed");
            let sig = k256::ecdsa::Signature::from_der(&der).expect("der should parse");
            assert!(sig.normalize_s().is_none(), "signature must already be low-S");
        }
    }

    #[test]
    fn ed25519_verify_fails_when_message_changes() {
        let key = SigningKey::from_secret(SigningAlgorithm::Ed25519, [0x10_u8; 32])
            .expect("any seed is valid");
        let signature = key.sign(b"original").expect("sign should succeed");
        let ok = verify(
            SigningAlgorithm::Ed25519,
            &key.public_key(),
            b"tampered",
            &signature,
        )
        .expect("verify should run");
        assert!(!ok);
    }

    #[test]
    fn zero_scalar_is_rejected_for_ecdsa() {
        let err = SigningKey::from_secret(SigningAlgorithm::Ecdsa, [0_u8; 32])
            .expect_err("zero is not a valid scalar");
        assert_eq!(err, SigningError::InvalidSecretKey);
    }

    #[test]
    fn algorithm_names_deserialize_lowercase() {
        #[derive(serde::Deserialize)]
        struct Holder {
            algorithm: SigningAlgorithm,
        }
        let holder: Holder =
            ciborium::de::from_reader(&encode_map("ed25519")[..]).expect("cbor should decode");
        assert_eq!(holder.algorithm, SigningAlgorithm::Ed25519);
    }

    fn encode_map(value: &str) -> Vec<u8> {
        let mut out = Vec::new();
        let map = std::collections::BTreeMap::from([("algorithm", value)]);
        ciborium::ser::into_writer(&map, &mut out).expect("cbor should encode");
        out
    }
}
