//! FaceNet (InceptionResnetV1) face embedder via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned 160×160 face crops,
//! using InceptionResnetV1 pretrained on VGGFace2.

use crate::types::{AlignedFace, Embedding};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
pub const FACENET_INPUT_SIZE: usize = 160;
pub const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "vggface2";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — export InceptionResnetV1 to ONNX and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("aligned face is {height}×{width}, embedder expects {expected}×{expected}")]
    WrongInputSize {
        height: usize,
        width: usize,
        expected: usize,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an aligned face to a fixed-length embedding vector.
pub trait Embedder {
    fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbedderError>;
}

impl<T: Embedder + ?Sized> Embedder for Box<T> {
    fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbedderError> {
        (**self).embed(face)
    }
}

/// InceptionResnetV1-based face embedder.
pub struct FaceNetEmbedder {
    session: Session,
}

impl FaceNetEmbedder {
    /// Load the InceptionResnetV1 ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            execution = "cpu",
            "loaded InceptionResnetV1 model"
        );

        Ok(Self { session })
    }
}

/// Reject faces that do not match the network input size.
fn check_input(face: &AlignedFace) -> Result<(), EmbedderError> {
    if face.height() != FACENET_INPUT_SIZE || face.width() != FACENET_INPUT_SIZE {
        return Err(EmbedderError::WrongInputSize {
            height: face.height(),
            width: face.width(),
            expected: FACENET_INPUT_SIZE,
        });
    }
    Ok(())
}

/// Validate the raw network output length.
fn into_embedding(raw: Vec<f32>) -> Result<Embedding, EmbedderError> {
    if raw.len() != FACENET_EMBEDDING_DIM {
        return Err(EmbedderError::InferenceFailed(format!(
            "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    Ok(Embedding {
        values: raw,
        model_version: Some(FACENET_MODEL_VERSION.to_string()),
    })
}

impl Embedder for FaceNetEmbedder {
    /// The face is already standardized by the detector; the network output
    /// is L2-normalized internally, so it is returned unchanged.
    fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbedderError> {
        check_input(face)?;
        let input = face.to_input_tensor();

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        into_embedding(raw_data.to_vec())
    }
}
