//! Model resolution: a reference from a request becomes a concrete ONNX
//! file path, or a fatal error when the file is missing.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

const MODEL_EXT: &str = "onnx";

pub trait ModelStore {
    /// Resolve a model reference to an existing file. A missing model is
    /// always fatal; there is no silent substitution.
    fn resolve(&self, reference: &str) -> Result<PathBuf>;

    /// Names of the models the store knows about, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

/// A flat directory of `.onnx` files, looked up by file stem.
///
/// References that are themselves paths to existing files bypass the
/// directory, so requests can point at models outside the store.
pub struct DirModelStore {
    models_dir: PathBuf,
}

impl DirModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }
}

impl ModelStore for DirModelStore {
    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let direct = Path::new(reference);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }

        let mut candidate = self.models_dir.join(reference);
        if candidate.extension().is_none() {
            candidate.set_extension(MODEL_EXT);
        }
        if candidate.is_file() {
            return Ok(candidate);
        }

        bail!(
            "model '{}' not found (looked for {})",
            reference,
            candidate.display()
        );
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            // an absent store is empty, not broken
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                bail!(
                    "failed to read models directory {}: {e}",
                    self.models_dir.display()
                );
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_model = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(MODEL_EXT));
            if is_model && path.is_file() {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("general-x4.onnx");
        std::fs::write(&model, b"onnx").unwrap();

        let store = DirModelStore::new(dir.path());
        assert_eq!(store.resolve("general-x4").unwrap(), model);
        assert_eq!(store.resolve("general-x4.onnx").unwrap(), model);
    }

    #[test]
    fn test_resolve_direct_path_bypasses_store() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("elsewhere.onnx");
        std::fs::write(&model, b"onnx").unwrap();

        let store = DirModelStore::new("/nonexistent/models");
        assert_eq!(store.resolve(model.to_str().unwrap()).unwrap(), model);
    }

    #[test]
    fn test_resolve_missing_model_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirModelStore::new(dir.path());
        let err = store.resolve("ghost").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_list_sorted_onnx_stems_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b-model.onnx"), b"x").unwrap();
        std::fs::write(dir.path().join("a-model.onnx"), b"x").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"x").unwrap();

        let store = DirModelStore::new(dir.path());
        assert_eq!(store.list().unwrap(), vec!["a-model", "b-model"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let store = DirModelStore::new("/nonexistent/models");
        assert!(store.list().unwrap().is_empty());
    }
}
