//! Classifier capability and its process-wide lazy handle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_finder_parking_models::FeatureVector;

use crate::PredictError;
use crate::forest::ModelArtifact;

/// A trained binary occupancy classifier.
pub trait Classifier: Send + Sync {
    /// Probability of the positive (occupied) class for every row, in row
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`PredictError`] if inference fails.
    fn predict_probability(&self, rows: &[FeatureVector]) -> Result<Vec<f64>, PredictError>;
}

type LoadResult = Result<Arc<dyn Classifier>, String>;

enum Origin {
    Path(PathBuf),
    Preloaded,
}

/// Lazily loaded, shared classifier.
///
/// The artifact is read on first use and never again. A failed load is
/// remembered and reported as [`PredictError::ModelUnavailable`] on every
/// later call.
pub struct ModelHandle {
    origin: Origin,
    cell: OnceLock<LoadResult>,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match &self.origin {
            Origin::Path(path) => path.display().to_string(),
            Origin::Preloaded => "<preloaded>".to_string(),
        };
        f.debug_struct("ModelHandle")
            .field("origin", &origin)
            .field("loaded", &self.cell.get().map(Result::is_ok))
            .finish()
    }
}

impl ModelHandle {
    /// A handle that loads the JSON artifact at `path` on first use.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            origin: Origin::Path(path.as_ref().to_path_buf()),
            cell: OnceLock::new(),
        }
    }

    /// A handle around an already-built classifier.
    #[must_use]
    pub fn preloaded(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            origin: Origin::Preloaded,
            cell: OnceLock::from(Ok(classifier)),
        }
    }

    /// Returns the classifier, loading it on the first call.
    ///
    /// # Errors
    ///
    /// Returns [`PredictError::ModelUnavailable`] if the artifact is missing
    /// or corrupt.
    pub fn get(&self) -> Result<Arc<dyn Classifier>, PredictError> {
        self.cell
            .get_or_init(|| self.load())
            .clone()
            .map_err(|message| PredictError::ModelUnavailable { message })
    }

    fn load(&self) -> LoadResult {
        match &self.origin {
            Origin::Path(path) => match ModelArtifact::from_path(path) {
                Ok(artifact) => {
                    log::info!("Loaded {} from {}", artifact.describe(), path.display());
                    Ok(Arc::new(artifact))
                }
                Err(e) => {
                    log::error!("Failed to load model from {}: {e}", path.display());
                    Err(e.to_string())
                }
            },
            Origin::Preloaded => Err("preloaded model missing".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(f64);

    impl Classifier for Constant {
        fn predict_probability(&self, rows: &[FeatureVector]) -> Result<Vec<f64>, PredictError> {
            Ok(vec![self.0; rows.len()])
        }
    }

    #[test]
    fn missing_artifact_is_cached_as_unavailable() {
        let handle = ModelHandle::from_path("/nonexistent/parking-model.json");
        for _ in 0..2 {
            assert!(matches!(
                handle.get(),
                Err(PredictError::ModelUnavailable { .. })
            ));
        }
        assert!(format!("{handle:?}").contains("Some(false)"));
    }

    #[test]
    fn preloaded_handle_returns_model() {
        let handle = ModelHandle::preloaded(Arc::new(Constant(0.25)));
        let model = handle.get().unwrap();
        let rows = [FeatureVector::from_values([0.0; 6])];
        assert_eq!(model.predict_probability(&rows).unwrap(), vec![0.25]);
    }

    #[test]
    fn loads_artifact_once() {
        let path = std::env::temp_dir().join(format!("parking-model-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"kind": "logistic_regression", "coefficients": [0, 0, 0, 0, 0, 0], "intercept": 0}"#,
        )
        .unwrap();
        let handle = ModelHandle::from_path(&path);
        let first = handle.get().unwrap();

        std::fs::remove_file(&path).unwrap();
        let second = handle.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
