use ndarray::{Array3, Array4, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// A face crop aligned to the canonical input size of the embedder.
///
/// Pixel data is stored channel-major: `[channel][row][column]`. The axis
/// constants below are the only way callers should address a dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedFace {
    data: Array3<f32>,
}

impl AlignedFace {
    pub const CHANNEL_AXIS: Axis = Axis(0);
    pub const ROW_AXIS: Axis = Axis(1);
    pub const COLUMN_AXIS: Axis = Axis(2);

    /// Wrap a channel-major tensor. Returns `None` unless it has 3 channels
    /// and non-zero spatial extent.
    pub fn from_channel_major(data: Array3<f32>) -> Option<Self> {
        let shape = data.shape();
        if shape[0] != 3 || shape[1] == 0 || shape[2] == 0 {
            return None;
        }
        Some(Self { data })
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Self::CHANNEL_AXIS)
    }

    pub fn height(&self) -> usize {
        self.data.len_of(Self::ROW_AXIS)
    }

    pub fn width(&self) -> usize {
        self.data.len_of(Self::COLUMN_AXIS)
    }

    /// Value at `(channel, row, column)`.
    pub fn get(&self, channel: usize, row: usize, column: usize) -> Option<f32> {
        self.data.get([channel, row, column]).copied()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Mirror the face left-to-right (reverses the column axis).
    pub fn flip_horizontal(&self) -> Self {
        let mut flipped = self.data.view();
        flipped.invert_axis(Self::COLUMN_AXIS);
        Self {
            data: flipped.as_standard_layout().into_owned(),
        }
    }

    /// NCHW batch of one, as expected by the embedding network.
    pub fn to_input_tensor(&self) -> Array4<f32> {
        self.data
            .view()
            .insert_axis(Axis(0))
            .as_standard_layout()
            .into_owned()
    }
}

/// Outcome of running the detector on one view of an image.
///
/// A miss is an ordinary result, not an error.
#[derive(Debug, Clone)]
pub enum Detection {
    Found { face: AlignedFace, bbox: FaceBox },
    NotFound,
}

impl Detection {
    pub fn is_found(&self) -> bool {
        matches!(self, Detection::Found { .. })
    }
}

/// Face embedding vector (512-dimensional for InceptionResnetV1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "vggface2").
    pub model_version: Option<String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum AggregateError {
    #[error("no embeddings to aggregate")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unweighted element-wise mean. The result is not re-normalized.
    ///
    /// The model version is kept only when every input agrees on it.
    pub fn mean(embeddings: &[Embedding]) -> Result<Embedding, AggregateError> {
        let first = embeddings.first().ok_or(AggregateError::Empty)?;
        let dim = first.dim();

        let mut sum = vec![0.0f32; dim];
        for embedding in embeddings {
            if embedding.dim() != dim {
                return Err(AggregateError::DimensionMismatch {
                    expected: dim,
                    actual: embedding.dim(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(&embedding.values) {
                *acc += v;
            }
        }

        let count = embeddings.len() as f32;
        let values = sum.into_iter().map(|v| v / count).collect();

        let model_version = first
            .model_version
            .clone()
            .filter(|version| {
                embeddings
                    .iter()
                    .all(|e| e.model_version.as_deref() == Some(version.as_str()))
            });

        Ok(Embedding {
            values,
            model_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_version: None,
        }
    }

    #[test]
    fn test_mean_two_vectors() {
        let m = Embedding::mean(&[emb(vec![1.0, 2.0]), emb(vec![3.0, 6.0])]).unwrap();
        assert_eq!(m.values, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_is_not_renormalized() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        let m = Embedding::mean(&[a, b]).unwrap();
        assert!((m.l2_norm() - 0.5f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_mean_empty() {
        assert_eq!(Embedding::mean(&[]), Err(AggregateError::Empty));
    }

    #[test]
    fn test_mean_dimension_mismatch() {
        let err = Embedding::mean(&[emb(vec![1.0, 2.0]), emb(vec![1.0])]).unwrap_err();
        assert_eq!(
            err,
            AggregateError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_mean_keeps_shared_model_version() {
        let a = Embedding {
            values: vec![1.0],
            model_version: Some("vggface2".into()),
        };
        let b = Embedding {
            values: vec![3.0],
            model_version: Some("vggface2".into()),
        };
        let m = Embedding::mean(&[a, b.clone()]).unwrap();
        assert_eq!(m.model_version.as_deref(), Some("vggface2"));

        let c = Embedding {
            values: vec![3.0],
            model_version: None,
        };
        let m = Embedding::mean(&[b, c]).unwrap();
        assert!(m.model_version.is_none());
    }

    #[test]
    fn test_aligned_face_axes() {
        let face = AlignedFace::from_channel_major(Array3::zeros((3, 4, 6))).unwrap();
        assert_eq!(face.channels(), 3);
        assert_eq!(face.height(), 4);
        assert_eq!(face.width(), 6);
    }

    #[test]
    fn test_aligned_face_rejects_wrong_channels() {
        assert!(AlignedFace::from_channel_major(Array3::zeros((1, 4, 4))).is_none());
        assert!(AlignedFace::from_channel_major(Array3::zeros((3, 0, 4))).is_none());
    }

    #[test]
    fn test_flip_horizontal_reverses_columns_only() {
        let data = Array3::from_shape_fn((3, 2, 3), |(c, y, x)| (c * 100 + y * 10 + x) as f32);
        let face = AlignedFace::from_channel_major(data).unwrap();
        let flipped = face.flip_horizontal();

        assert_eq!(flipped.height(), 2);
        assert_eq!(flipped.width(), 3);
        for c in 0..3 {
            for y in 0..2 {
                for x in 0..3 {
                    assert_eq!(flipped.get(c, y, x), face.get(c, y, 2 - x));
                }
            }
        }
        assert_eq!(flipped.flip_horizontal(), face);
    }

    #[test]
    fn test_input_tensor_shape() {
        let face = AlignedFace::from_channel_major(Array3::zeros((3, 160, 160))).unwrap();
        assert_eq!(face.to_input_tensor().shape(), &[1, 3, 160, 160]);
    }
}
