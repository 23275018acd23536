use ndarray::Array4;
use ort::{inputs, session::Session, value::Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model file not found: {path}")]
    NotFound { path: String },

    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    #[error("Model has no inputs: {path}")]
    NoInputs { path: String },

    #[error("Unexpected model output: {message}")]
    UnexpectedOutput { message: String },

    #[error("Model session lock poisoned")]
    Poisoned,
}

/// One output tensor copied out of the session.
#[derive(Debug, Clone)]
pub struct OutputTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// A single-input ONNX model. Runs are serialised through a mutex because
/// `Session::run` needs exclusive access.
pub struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
    output_names: Vec<String>,
    path: PathBuf,
}

impl OnnxModel {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::NotFound {
                path: path.display().to_string(),
            });
        }

        let session = Session::builder()?.commit_from_file(path)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ModelError::NoInputs {
                path: path.display().to_string(),
            })?;
        let output_names = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_names,
            path: path.to_path_buf(),
        })
    }

    /// Load an optional model, logging the outcome. Failures leave the caller inert.
    pub fn load_optional(path: Option<&Path>, label: &str) -> Option<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                log::info!("No {} model configured; {} extraction disabled", label, label);
                return None;
            }
        };

        match Self::load(path) {
            Ok(model) => {
                log::info!("Loaded {} model from {}", label, path.display());
                Some(model)
            }
            Err(e) => {
                log::error!(
                    "Failed to initialise {} model from {}: {}",
                    label,
                    path.display(),
                    e
                );
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short tag derived from the model file name, used in extractor version strings.
    pub fn tag(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "model".to_string())
    }

    /// Run the model and copy every output tensor, in declaration order.
    pub fn run(&self, input: Array4<f32>) -> Result<Vec<OutputTensor>, ModelError> {
        let tensor = Value::from_array(input)?;
        let mut session = self.session.lock().map_err(|_| ModelError::Poisoned)?;
        let outputs = session.run(inputs![self.input_name.as_str() => tensor])?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let (shape, data) = outputs[name.as_str()].try_extract_tensor::<f32>()?;
            let dims: &[i64] = shape.as_ref();
            tensors.push(OutputTensor {
                name: name.clone(),
                shape: dims.to_vec(),
                data: data.to_vec(),
            });
        }

        Ok(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_model_is_not_found() {
        let result = OnnxModel::load(Path::new("/non/existent/model.onnx"));
        assert!(matches!(result, Err(ModelError::NotFound { .. })));
    }

    #[test]
    fn test_load_optional_is_inert_on_failure() {
        assert!(OnnxModel::load_optional(None, "descriptor").is_none());

        let temp_dir = TempDir::new().unwrap();
        let bogus = temp_dir.path().join("bogus.onnx");
        std::fs::write(&bogus, b"not a protobuf").unwrap();
        assert!(OnnxModel::load_optional(Some(&bogus), "descriptor").is_none());
    }
}
