//! Multi-view recognition: rotate, detect, embed face and mirror, average.
//!
//! Each angle in [`AUGMENTATION_ANGLES`] gets one detector call. A hit adds
//! two embeddings (the aligned face and its horizontal mirror); a miss adds
//! nothing and is not an error. The result is the unweighted mean of every
//! collected embedding, so between 2 and 6 vectors contribute. Only when all
//! angles miss is the image reported as having no face.

use crate::detector::{Detector, DetectorError};
use crate::embedder::{Embedder, EmbedderError};
use crate::geometry::angle_view;
use crate::types::{AggregateError, AlignedFace, Detection, Embedding};
use image::RgbImage;
use thiserror::Error;

/// Rotation angles in degrees (positive = counter-clockwise). 0° is the
/// untouched input.
pub const AUGMENTATION_ANGLES: [f32; 3] = [0.0, -15.0, 15.0];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection failed at {angle}°: {source}")]
    Detector {
        angle: f32,
        #[source]
        source: DetectorError,
    },
    #[error("embedding failed at {angle}°: {source}")]
    Embedder {
        angle: f32,
        #[source]
        source: EmbedderError,
    },
    #[error("aggregation failed: {0}")]
    Aggregate(#[from] AggregateError),
}

/// Outcome of the whole multi-view run.
#[derive(Debug, Clone)]
pub enum Recognition {
    Found {
        embedding: Embedding,
        /// How many rotation angles produced a detection (1..=3).
        angles_detected: usize,
    },
    NotFound,
}

/// Run detection and embedding over every augmentation angle and aggregate.
pub fn recognize<D, E>(
    detector: &mut D,
    embedder: &mut E,
    image: &RgbImage,
) -> Result<Recognition, PipelineError>
where
    D: Detector + ?Sized,
    E: Embedder + ?Sized,
{
    let mut collected = Vec::with_capacity(AUGMENTATION_ANGLES.len() * 2);
    let mut angles_detected = 0usize;

    for angle in AUGMENTATION_ANGLES {
        let view = angle_view(image, angle);
        let detection = detector
            .detect(&view)
            .map_err(|source| PipelineError::Detector { angle, source })?;

        let Detection::Found { face, bbox } = detection else {
            tracing::debug!(angle, "no face at this angle");
            continue;
        };
        tracing::debug!(
            angle,
            confidence = bbox.confidence,
            width = bbox.width,
            height = bbox.height,
            "face detected"
        );
        angles_detected += 1;

        let embed = |embedder: &mut E, face: &AlignedFace| {
            embedder
                .embed(face)
                .map_err(|source| PipelineError::Embedder { angle, source })
        };
        collected.push(embed(embedder, &face)?);
        collected.push(embed(embedder, &face.flip_horizontal())?);
    }

    if angles_detected == 0 {
        return Ok(Recognition::NotFound);
    }

    let embedding = Embedding::mean(&collected)?;
    tracing::debug!(
        angles_detected,
        samples = collected.len(),
        dim = embedding.dim(),
        norm = embedding.l2_norm(),
        "aggregated embedding"
    );

    Ok(Recognition::Found {
        embedding,
        angles_detected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceBox;
    use image::Rgb;
    use ndarray::Array3;

    const DIM: usize = 8;

    fn face_box() -> FaceBox {
        FaceBox {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.99,
            landmarks: None,
        }
    }

    /// Finds a face on the scripted calls only; records the view sizes it saw.
    struct ScriptedDetector {
        hits: Vec<bool>,
        seen: Vec<(u32, u32)>,
    }

    impl ScriptedDetector {
        fn new(hits: &[bool]) -> Self {
            Self {
                hits: hits.to_vec(),
                seen: Vec::new(),
            }
        }
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectorError> {
            let call = self.seen.len();
            self.seen.push(image.dimensions());
            if !self.hits.get(call).copied().unwrap_or(false) {
                return Ok(Detection::NotFound);
            }
            // Left half 1.0, right half -1.0 so the mirror is distinguishable.
            let data =
                Array3::from_shape_fn((3, 4, 4), |(_, _, x)| if x < 2 { 1.0 } else { -1.0 });
            let face = AlignedFace::from_channel_major(data).expect("valid face");
            Ok(Detection::Found {
                face,
                bbox: face_box(),
            })
        }
    }

    /// Embeds a face as its top-left pixel repeated, counting calls.
    #[derive(Default)]
    struct CornerEmbedder {
        calls: usize,
    }

    impl Embedder for CornerEmbedder {
        fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbedderError> {
            self.calls += 1;
            let v = face.get(0, 0, 0).unwrap_or(0.0);
            Ok(Embedding {
                values: vec![v + self.calls as f32; DIM],
                model_version: None,
            })
        }
    }

    struct FailingDetector;
    impl Detector for FailingDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Detection, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb([120, 110, 100]))
    }

    #[test]
    fn test_no_detection_is_not_found() {
        let mut detector = ScriptedDetector::new(&[false, false, false]);
        let mut embedder = CornerEmbedder::default();
        let result = recognize(&mut detector, &mut embedder, &image()).unwrap();
        assert!(matches!(result, Recognition::NotFound));
        assert_eq!(embedder.calls, 0);
        assert_eq!(detector.seen.len(), 3);
    }

    #[test]
    fn test_views_are_identity_then_rotated() {
        let mut detector = ScriptedDetector::new(&[]);
        let mut embedder = CornerEmbedder::default();
        recognize(&mut detector, &mut embedder, &image()).unwrap();
        assert_eq!(detector.seen[0], (64, 48));
        // Rotated views grow the canvas; ±15° give the same size.
        assert!(detector.seen[1].0 > 64 && detector.seen[1].1 > 48);
        assert_eq!(detector.seen[1], detector.seen[2]);
    }

    #[test]
    fn test_single_hit_embeds_face_and_mirror() {
        let mut detector = ScriptedDetector::new(&[false, true, false]);
        let mut embedder = CornerEmbedder::default();
        let result = recognize(&mut detector, &mut embedder, &image()).unwrap();

        let Recognition::Found { embedding, angles_detected } = result else {
            panic!("expected a face");
        };
        assert_eq!(angles_detected, 1);
        assert_eq!(embedder.calls, 2);
        // Face corner 1.0 (+1 call), mirror corner -1.0 (+2 calls): mean 1.5.
        assert_eq!(embedding.values, vec![1.5; DIM]);
    }

    #[test]
    fn test_all_hits_average_six_vectors() {
        let mut detector = ScriptedDetector::new(&[true, true, true]);
        let mut embedder = CornerEmbedder::default();
        let result = recognize(&mut detector, &mut embedder, &image()).unwrap();

        let Recognition::Found { embedding, angles_detected } = result else {
            panic!("expected a face");
        };
        assert_eq!(angles_detected, 3);
        assert_eq!(embedder.calls, 6);
        // Corners alternate 1, -1 (sum 0); call offsets 1..=6 average 3.5.
        assert!(embedding.values.iter().all(|v| (v - 3.5).abs() < 1e-6));
    }

    #[test]
    fn test_dimension_independent_of_hit_count() {
        for hits in [[true, false, false], [true, true, false], [true, true, true]] {
            let mut detector = ScriptedDetector::new(&hits);
            let mut embedder = CornerEmbedder::default();
            match recognize(&mut detector, &mut embedder, &image()).unwrap() {
                Recognition::Found { embedding, .. } => assert_eq!(embedding.dim(), DIM),
                Recognition::NotFound => panic!("expected a face for {hits:?}"),
            }
        }
    }

    #[test]
    fn test_detector_error_propagates() {
        let mut embedder = CornerEmbedder::default();
        let err = recognize(&mut FailingDetector, &mut embedder, &image()).unwrap_err();
        assert!(matches!(err, PipelineError::Detector { angle, .. } if angle == 0.0));
    }

    #[test]
    fn test_mismatched_embedder_dimensions_fail() {
        struct Growing(usize);
        impl Embedder for Growing {
            fn embed(&mut self, _face: &AlignedFace) -> Result<Embedding, EmbedderError> {
                self.0 += 1;
                Ok(Embedding {
                    values: vec![0.0; self.0],
                    model_version: None,
                })
            }
        }
        let mut detector = ScriptedDetector::new(&[true]);
        let err = recognize(&mut detector, &mut Growing(0), &image()).unwrap_err();
        assert!(matches!(err, PipelineError::Aggregate(AggregateError::DimensionMismatch { .. })));
    }
}
