//! Model stand-ins for engine and router tests.
//!
//! The fake detector treats any image whose middle third has visible contrast
//! as containing a face, which holds for the centered dark square drawn by
//! [`face_image`] at every augmentation angle and fails for flat images.

use facenet_core::detector::DetectorError;
use facenet_core::embedder::EmbedderError;
use facenet_core::models::ModelError;
use facenet_core::{AlignedFace, Detection, Detector, Embedder, Embedding, FaceBox, ModelProvider};
use image::{Rgb, RgbImage};
use ndarray::Array3;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const EMBEDDING_DIM: usize = 512;
const FACE_SIDE: usize = 160;
const MIN_CONTRAST: u8 = 32;

/// Light background with a dark square in the middle.
pub fn face_image(width: u32, height: u32) -> RgbImage {
    let side = (width.min(height) / 5).max(2);
    let (x0, y0) = ((width - side) / 2, (height - side) / 2);
    RgbImage::from_fn(width, height, |x, y| {
        if (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y) {
            Rgb([40, 35, 30])
        } else {
            Rgb([200, 190, 180])
        }
    })
}

pub fn uniform_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([90, 140, 200]))
}

pub struct ContrastDetector {
    seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl Detector for ContrastDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectorError> {
        let (width, height) = image.dimensions();
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((width, height));
        }

        let (mut lo, mut hi) = (u8::MAX, u8::MIN);
        for y in height / 3..(2 * height / 3) {
            for x in width / 3..(2 * width / 3) {
                let luma = image.get_pixel(x, y)[1];
                lo = lo.min(luma);
                hi = hi.max(luma);
            }
        }
        if hi.saturating_sub(lo) < MIN_CONTRAST {
            return Ok(Detection::NotFound);
        }

        let level = (hi as f32 - 127.5) / 128.0;
        let data = Array3::from_shape_fn((3, FACE_SIDE, FACE_SIDE), |(c, _, x)| {
            level + c as f32 * 0.01 + x as f32 * 1e-4
        });
        let face = AlignedFace::from_channel_major(data)
            .ok_or_else(|| DetectorError::InferenceFailed("bad fake face".into()))?;
        let bbox = FaceBox {
            x: (width / 3) as f32,
            y: (height / 3) as f32,
            width: (width / 3) as f32,
            height: (height / 3) as f32,
            confidence: 0.99,
            landmarks: None,
        };
        Ok(Detection::Found { face, bbox })
    }
}

/// Embeds a face as a ramp offset by its first and last column values.
pub struct RampEmbedder;

impl Embedder for RampEmbedder {
    fn embed(&mut self, face: &AlignedFace) -> Result<Embedding, EmbedderError> {
        let left = face.get(0, 0, 0).unwrap_or(0.0);
        let right = face.get(0, 0, face.width() - 1).unwrap_or(0.0);
        Ok(Embedding {
            values: (0..EMBEDDING_DIM)
                .map(|i| left + 2.0 * right + i as f32 / EMBEDDING_DIM as f32)
                .collect(),
            model_version: Some("fake".into()),
        })
    }
}

#[derive(Default)]
pub struct FakeModels {
    pub builds: Arc<AtomicUsize>,
    pub seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl ModelProvider for FakeModels {
    type Detector = ContrastDetector;
    type Embedder = RampEmbedder;

    fn build_detector(&self) -> Result<ContrastDetector, ModelError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(ContrastDetector {
            seen: self.seen.clone(),
        })
    }

    fn build_embedder(&self) -> Result<RampEmbedder, ModelError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(RampEmbedder)
    }
}

/// Provider whose model files are never present.
pub struct BrokenModels;

impl ModelProvider for BrokenModels {
    type Detector = ContrastDetector;
    type Embedder = RampEmbedder;

    fn build_detector(&self) -> Result<ContrastDetector, ModelError> {
        Err(DetectorError::ModelNotFound("/models/pnet.onnx".into()).into())
    }

    fn build_embedder(&self) -> Result<RampEmbedder, ModelError> {
        Err(EmbedderError::ModelNotFound("/models/inception_resnet_v1_vggface2.onnx".into()).into())
    }
}

pub struct ExplodingDetector;

impl Detector for ExplodingDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Detection, DetectorError> {
        panic!("detector exploded")
    }
}

/// Provider whose detector panics on every call.
pub struct PanickingModels;

impl ModelProvider for PanickingModels {
    type Detector = ExplodingDetector;
    type Embedder = RampEmbedder;

    fn build_detector(&self) -> Result<ExplodingDetector, ModelError> {
        Ok(ExplodingDetector)
    }

    fn build_embedder(&self) -> Result<RampEmbedder, ModelError> {
        Ok(RampEmbedder)
    }
}
