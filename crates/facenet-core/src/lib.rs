//! facenet-core — Face detection and embedding engine.
//!
//! Uses an MTCNN cascade for face detection and alignment and an
//! InceptionResnetV1 (FaceNet) network for embeddings, both running via
//! ONNX Runtime for CPU inference.

pub mod detector;
pub mod embedder;
pub mod geometry;
pub mod models;
pub mod pipeline;
pub mod preprocess;
pub mod types;

use std::path::PathBuf;

pub use detector::{Detector, DetectorConfig, MtcnnDetector};
pub use embedder::{Embedder, FaceNetEmbedder};
pub use models::{ModelCache, ModelProvider, OnnxModels};
pub use pipeline::{recognize, Recognition, AUGMENTATION_ANGLES};
pub use preprocess::resize_if_needed;
pub use types::{AlignedFace, Detection, Embedding, FaceBox};

/// Default directory for ONNX model files.
///
/// Resolves to `$XDG_DATA_HOME/facenet/models`, falling back to
/// `~/.local/share/facenet/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facenet")
        .join("models")
}
