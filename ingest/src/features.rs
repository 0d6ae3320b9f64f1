// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Feature store: a thin file-copy plus manifest-insert over the catalog.
//! Versioned feature files live under `features/<set>/<version>/` and are
//! indexed like any other entry, with `type` set to the feature-set name.

use crate::IngestError;
use core_types::SeriesIdentity;
use log::info;
use manifest::{rel_path_string, Manifest, ManifestEntry, NewEntry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::sha256_file;

pub struct FeatureStore {
    root: PathBuf,
    manifest: Arc<Manifest>,
}

impl FeatureStore {
    pub fn new(root: impl Into<PathBuf>, manifest: Arc<Manifest>) -> Self {
        Self {
            root: root.into(),
            manifest,
        }
    }

    /// Copy an externally computed feature file into the lake and register
    /// it. Returns the stored entry.
    pub fn upload(
        &self,
        src: &Path,
        identity: &SeriesIdentity,
        feature_set: &str,
        version: &str,
    ) -> Result<ManifestEntry, IngestError> {
        if !src.exists() {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source file {} not found", src.display()),
            )));
        }
        let file_name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                IngestError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "source path has no file name",
                ))
            })?
            .to_string();
        let dest = self.dest_path(feature_set, version, &file_name)?;
        std::fs::copy(src, &dest)?;
        self.register(&dest, identity, feature_set, version)
    }

    /// Same as [`FeatureStore::upload`] but from an in-memory body, as
    /// delivered by a multipart upload.
    pub fn upload_bytes(
        &self,
        bytes: &[u8],
        file_name: &str,
        identity: &SeriesIdentity,
        feature_set: &str,
        version: &str,
    ) -> Result<ManifestEntry, IngestError> {
        let dest = self.dest_path(feature_set, version, file_name)?;
        std::fs::write(&dest, bytes)?;
        self.register(&dest, identity, feature_set, version)
    }

    fn dest_path(
        &self,
        feature_set: &str,
        version: &str,
        file_name: &str,
    ) -> Result<PathBuf, IngestError> {
        let name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                IngestError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "upload has no usable file name",
                ))
            })?;
        let dest = self
            .root
            .join("features")
            .join(feature_set)
            .join(version)
            .join(name);
        std::fs::create_dir_all(dest.parent().expect("feature path has a parent"))?;
        Ok(dest)
    }

    fn register(
        &self,
        dest: &Path,
        identity: &SeriesIdentity,
        feature_set: &str,
        version: &str,
    ) -> Result<ManifestEntry, IngestError> {
        let checksum = sha256_file(dest)?;
        let file_size = std::fs::metadata(dest)?.len() as i64;
        let rel = dest.strip_prefix(&self.root).unwrap_or(dest);
        let id = self.manifest.upsert(&NewEntry {
            identity: identity.clone(),
            data_type: feature_set.to_string(),
            period: None,
            path: rel_path_string(rel),
            time_from: None,
            time_to: None,
            row_count: 0,
            file_size,
            checksum,
            version: Some(version.to_string()),
        })?;
        info!(
            "feature upload {} v{} for {} registered as entry {}",
            feature_set, version, identity, id
        );
        Ok(self.manifest.get(id)?)
    }

    /// The entry holding the latest version of a feature set for one
    /// series, by lexicographic version order.
    pub fn latest(
        &self,
        feature_set: &str,
        identity: &SeriesIdentity,
    ) -> Result<Option<ManifestEntry>, IngestError> {
        Ok(self.manifest.latest_version(feature_set, identity)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn upload_copies_registers_and_resolves_latest() {
        let dir = TempDir::new().unwrap();
        let manifest = Arc::new(Manifest::open(&dir.path().join("manifest.db")).unwrap());
        let store = FeatureStore::new(dir.path(), Arc::clone(&manifest));
        let identity = SeriesIdentity::new("binance", "spot", "BTCUSDT");

        let src = dir.path().join("alpha.parquet");
        std::fs::write(&src, b"feature bytes").unwrap();

        let v1 = store.upload(&src, &identity, "alpha_set", "1.0.0").unwrap();
        assert_eq!(v1.path, "features/alpha_set/1.0.0/alpha.parquet");
        assert!(dir.path().join(&v1.path).exists());
        assert_eq!(v1.checksum, sha256_file(&src).unwrap());

        store.upload(&src, &identity, "alpha_set", "1.1.0").unwrap();
        let latest = store.latest("alpha_set", &identity).unwrap().unwrap();
        assert_eq!(latest.version.as_deref(), Some("1.1.0"));

        assert_eq!(manifest.feature_sets().unwrap(), vec!["alpha_set"]);
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manifest = Arc::new(Manifest::open(&dir.path().join("manifest.db")).unwrap());
        let store = FeatureStore::new(dir.path(), manifest);
        let identity = SeriesIdentity::new("binance", "spot", "BTCUSDT");

        let err = store
            .upload(Path::new("/no/such/file"), &identity, "alpha_set", "1.0.0")
            .unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
    }
}
