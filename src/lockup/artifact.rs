//! Model artifact files and integrity checks
//!
//! An artifact is the serialized network plus a `.sha256` sidecar holding the
//! hex SHA-256 of the artifact bytes as of the last successful save. Both
//! files are required; a model whose bytes no longer match the sidecar is
//! never put in service.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::model::LockupNet;

/// Sidecar file extension appended to the artifact file name
pub const SIDECAR_EXTENSION: &str = "sha256";

/// Startup-fatal problems with the model artifact
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("model artifact {} not found", .path.display())]
    MissingArtifact { path: PathBuf },
    #[error("hash sidecar {} not found", .path.display())]
    MissingSidecar { path: PathBuf },
    #[error("failed to read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("hash sidecar {} is malformed: {reason}", .path.display())]
    MalformedSidecar { path: PathBuf, reason: String },
    #[error("model artifact {} failed integrity check: recorded sha256 {expected}, computed {actual}", .path.display())]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("model artifact {} could not be decoded: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Lowercase hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `<artifact>.sha256`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Serialized weights plus the hash recorded for them
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    weights: Vec<u8>,
    recorded_hash: String,
}

impl ModelArtifact {
    /// Serialize `net` and record a fresh hash
    pub fn from_net(net: &LockupNet) -> Result<Self, serde_json::Error> {
        let weights = serde_json::to_vec(net)?;
        let recorded_hash = content_hash(&weights);
        Ok(Self { weights, recorded_hash })
    }

    /// Read an artifact and its sidecar. Nothing is verified yet.
    pub fn load(path: &Path) -> Result<Self, IntegrityError> {
        let sidecar = sidecar_path(path);
        let weights = read_required(path, || IntegrityError::MissingArtifact { path: path.to_path_buf() })?;
        let raw = read_required(&sidecar, || IntegrityError::MissingSidecar { path: sidecar.clone() })?;

        let recorded_hash = String::from_utf8(raw)
            .map_err(|_| IntegrityError::MalformedSidecar {
                path: sidecar.clone(),
                reason: "not UTF-8".to_string(),
            })?
            .trim()
            .to_lowercase();
        if recorded_hash.len() != 64 || !recorded_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IntegrityError::MalformedSidecar {
                path: sidecar,
                reason: "expected 64 hex characters".to_string(),
            });
        }
        Ok(Self { weights, recorded_hash })
    }

    pub fn recorded_hash(&self) -> &str {
        &self.recorded_hash
    }

    /// Hash of the weights as they are now
    pub fn computed_hash(&self) -> String {
        content_hash(&self.weights)
    }

    pub fn weights(&self) -> &[u8] {
        &self.weights
    }

    /// Compare recorded and computed hashes. `path` is only used for the error.
    pub fn verify(&self, path: &Path) -> Result<(), IntegrityError> {
        let actual = self.computed_hash();
        if actual != self.recorded_hash {
            return Err(IntegrityError::HashMismatch {
                path: path.to_path_buf(),
                expected: self.recorded_hash.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Decode the network. Callers verify first.
    pub fn decode(&self, path: &Path) -> Result<LockupNet, IntegrityError> {
        let net: LockupNet = serde_json::from_slice(&self.weights).map_err(|e| IntegrityError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        net.validate()
            .map_err(|reason| IntegrityError::Malformed { path: path.to_path_buf(), reason })?;
        Ok(net)
    }

    /// Load, verify and decode in one step
    pub fn load_verified(path: &Path) -> Result<(Self, LockupNet), IntegrityError> {
        let artifact = Self::load(path)?;
        artifact.verify(path)?;
        let net = artifact.decode(path)?;
        Ok((artifact, net))
    }

    /// Write the weights, then the sidecar, each via temp file and rename.
    /// A crash between the two leaves a mismatched pair, which `load_verified` rejects.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        atomic_write(path, &self.weights)?;
        atomic_write(&sidecar_path(path), format!("{}\n", self.recorded_hash).as_bytes())
    }
}

fn read_required(path: &Path, missing: impl FnOnce() -> IntegrityError) -> Result<Vec<u8>, IntegrityError> {
    std::fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            missing()
        } else {
            IntegrityError::Unreadable { path: path.to_path_buf(), source }
        }
    })
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
