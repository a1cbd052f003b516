// artifact_store.rs
// Versioned model artifacts and the registry manifest on the local filesystem

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{LoopError, LoopResult};
use crate::model_version::{ArtifactRef, RegistryManifest};
use crate::pipeline::SentimentModel;

const MODEL_FILE: &str = "model.json";
const MANIFEST_FILE: &str = "registry.json";

/// Storage for serialized models and the registry manifest.
///
/// Every failure is a `RegistryCorruption`: the registry treats an
/// unreadable or unwritable artifact as fatal for the transition at hand.
pub trait ArtifactStore: Send + Sync {
    fn write_model(&self, version: &str, model: &SentimentModel) -> LoopResult<ArtifactRef>;

    /// Read and verify against the recorded checksum.
    fn read_model(&self, version: &str, artifact: &ArtifactRef) -> LoopResult<SentimentModel>;

    fn read_manifest(&self) -> LoopResult<Option<RegistryManifest>>;

    fn write_manifest(&self, manifest: &RegistryManifest) -> LoopResult<()>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// `<root>/<version>/model.json` plus `<root>/registry.json`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn open(root: impl AsRef<Path>) -> LoopResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            LoopError::registry_corruption(
                "-",
                format!("cannot create artifact dir {}: {e}", root.display()),
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

impl ArtifactStore for FsArtifactStore {
    fn write_model(&self, version: &str, model: &SentimentModel) -> LoopResult<ArtifactRef> {
        let bytes = serde_json::to_vec(model)
            .map_err(|e| LoopError::registry_corruption(version, format!("serialize: {e}")))?;
        let dir = self.root.join(version);
        fs::create_dir_all(&dir)
            .map_err(|e| LoopError::registry_corruption(version, format!("create dir: {e}")))?;
        write_atomic(&dir.join(MODEL_FILE), &bytes)
            .map_err(|e| LoopError::registry_corruption(version, format!("write artifact: {e}")))?;

        let artifact = ArtifactRef {
            path: format!("{version}/{MODEL_FILE}"),
            sha256: sha256_hex(&bytes),
        };
        tracing::debug!(version, sha256 = %artifact.sha256, "artifact written");
        Ok(artifact)
    }

    fn read_model(&self, version: &str, artifact: &ArtifactRef) -> LoopResult<SentimentModel> {
        let path = self.root.join(&artifact.path);
        let bytes = fs::read(&path).map_err(|e| {
            LoopError::registry_corruption(version, format!("read {}: {e}", path.display()))
        })?;
        let digest = sha256_hex(&bytes);
        if digest != artifact.sha256 {
            return Err(LoopError::registry_corruption(
                version,
                format!("checksum mismatch: expected {}, found {digest}", artifact.sha256),
            ));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| LoopError::registry_corruption(version, format!("deserialize: {e}")))
    }

    fn read_manifest(&self) -> LoopResult<Option<RegistryManifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .map_err(|e| LoopError::registry_corruption("manifest", format!("read: {e}")))?;
        let manifest = serde_json::from_slice(&bytes)
            .map_err(|e| LoopError::registry_corruption("manifest", format!("parse: {e}")))?;
        Ok(Some(manifest))
    }

    fn write_manifest(&self, manifest: &RegistryManifest) -> LoopResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| LoopError::registry_corruption("manifest", format!("serialize: {e}")))?;
        write_atomic(&self.manifest_path(), &bytes)
            .map_err(|e| LoopError::registry_corruption("manifest", format!("write: {e}")))
    }
}
