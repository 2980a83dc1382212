use std::fs;
use std::path::{Path, PathBuf};

use k256::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signing::{Signer, SigningAlgorithm, SigningError, SigningKey};

/// Errors raised while loading identity material. All of them are fatal at
/// startup: no valid signed unit can be produced without the material.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read {kind} from {}: {source}", path.display())]
    Read {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported private key format in {}", path.display())]
    UnsupportedKeyFormat { path: PathBuf },
    #[error("invalid private key in {}: {source}", path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: SigningError,
    },
    #[error("signing certificate {} is empty", path.display())]
    EmptyCertificate { path: PathBuf },
    #[error("msp id must not be empty")]
    EmptyMspId,
    #[error("identity serialization failed: {0}")]
    Serialize(String),
}

/// Creator identity embedded in every signature header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedIdentity {
    pub msp_id: String,
    #[serde(with = "fabload_core::bytes_serde")]
    pub id_bytes: Vec<u8>,
}

impl SerializedIdentity {
    pub fn to_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|err| IdentityError::Serialize(err.to_string()))?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        ciborium::de::from_reader(bytes).map_err(|err| IdentityError::Serialize(err.to_string()))
    }
}

/// Where to find identity material on disk.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityConfig {
    pub msp_id: String,
    pub private_key: PathBuf,
    pub sign_cert: PathBuf,
    #[serde(default)]
    pub tls_ca_certs: Vec<PathBuf>,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
}

/// Loaded signing identity: key, certificate, serialized creator, and trust
/// anchors. Immutable after load and shared read-only across tasks.
#[derive(Debug, Clone)]
pub struct Identity {
    msp_id: String,
    key: SigningKey,
    sign_cert: Vec<u8>,
    creator: Vec<u8>,
    tls_ca_certs: Vec<Vec<u8>>,
}

impl Identity {
    /// Builds an identity from in-memory material.
    pub fn new(
        msp_id: impl Into<String>,
        key: SigningKey,
        sign_cert: Vec<u8>,
        tls_ca_certs: Vec<Vec<u8>>,
    ) -> Result<Self, IdentityError> {
        let msp_id = msp_id.into();
        if msp_id.trim().is_empty() {
            return Err(IdentityError::EmptyMspId);
        }
        let creator = SerializedIdentity {
            msp_id: msp_id.clone(),
            id_bytes: sign_cert.clone(),
        }
        .to_bytes()?;
        Ok(Self {
            msp_id,
            key,
            sign_cert,
            creator,
            tls_ca_certs,
        })
    }

    /// Loads key, certificate and trust anchors from the configured files.
    pub fn load(config: &IdentityConfig) -> Result<Self, IdentityError> {
        let key = load_private_key(&config.private_key, config.algorithm)?;
        let sign_cert = read_file("signing certificate", &config.sign_cert)?;
        if sign_cert.is_empty() {
            return Err(IdentityError::EmptyCertificate {
                path: config.sign_cert.clone(),
            });
        }
        let tls_ca_certs = config
            .tls_ca_certs
            .iter()
            .map(|path| read_file("tls ca certificate", path))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(config.msp_id.clone(), key, sign_cert, tls_ca_certs)
    }

    /// Generates a throwaway identity whose "certificate" is the hex public key.
    pub fn ephemeral(msp_id: impl Into<String>, algorithm: SigningAlgorithm) -> Result<Self, IdentityError> {
        let key = SigningKey::generate(algorithm);
        let cert = hex::encode(key.public_key()).into_bytes();
        Self::new(msp_id, key, cert, Vec::new())
    }

    pub fn msp_id(&self) -> &str {
        &self.msp_id
    }

    pub fn sign_cert(&self) -> &[u8] {
        &self.sign_cert
    }

    pub fn tls_ca_certs(&self) -> &[Vec<u8>] {
        &self.tls_ca_certs
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.key.public_key()
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.key.algorithm()
    }
}

impl Signer for Identity {
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, SigningError> {
        self.key.sign(msg)
    }

    fn identity(&self) -> &[u8] {
        &self.creator
    }
}

fn read_file(kind: &'static str, path: &Path) -> Result<Vec<u8>, IdentityError> {
    fs::read(path).map_err(|source| IdentityError::Read {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

/// Accepts PKCS#8 / SEC1 PEM (ECDSA only) or a hex-encoded 32-byte secret.
fn load_private_key(path: &Path, algorithm: SigningAlgorithm) -> Result<SigningKey, IdentityError> {
    let raw = read_file("private key", path)?;
    let text = String::from_utf8_lossy(&raw);
    let trimmed = text.trim();

    if trimmed.starts_with("-----BEGIN") {
        if algorithm != SigningAlgorithm::Ecdsa {
            return Err(IdentityError::UnsupportedKeyFormat {
                path: path.to_path_buf(),
            });
        }
        if let Ok(key) = k256::ecdsa::SigningKey::from_pkcs8_pem(trimmed) {
            return Ok(SigningKey::Ecdsa(key));
        }
        return k256::SecretKey::from_sec1_pem(trimmed)
            .map(|secret| SigningKey::Ecdsa(secret.into()))
            .map_err(|_| IdentityError::UnsupportedKeyFormat {
                path: path.to_path_buf(),
            });
    }

    let bytes = hex::decode(trimmed).map_err(|_| IdentityError::UnsupportedKeyFormat {
        path: path.to_path_buf(),
    })?;
    let secret = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        IdentityError::UnsupportedKeyFormat {
            path: path.to_path_buf(),
        }
    })?;
    SigningKey::from_secret(algorithm, secret).map_err(|source| IdentityError::InvalidKey {
        path: path.to_path_buf(),
        source,
    })
}
