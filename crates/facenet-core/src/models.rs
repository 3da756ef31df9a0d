//! Lazily constructed model handles.
//!
//! A [`ModelProvider`] knows how to build the detector and the embedder; a
//! [`ModelCache`] builds each of them at most once, on first demand or through
//! an explicit [`ModelCache::initialize`] call, and hands out the same
//! instance for the rest of its life. The cache takes `&mut self`, so it has a
//! single owner (the inference thread) and cannot be raced into building twice.

use crate::detector::{Detector, DetectorConfig, DetectorError, MtcnnDetector};
use crate::embedder::{Embedder, EmbedderError, FaceNetEmbedder};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

pub const PNET_FILE: &str = "pnet.onnx";
pub const RNET_FILE: &str = "rnet.onnx";
pub const ONET_FILE: &str = "onet.onnx";
pub const FACENET_FILE: &str = "inception_resnet_v1_vggface2.onnx";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Builds the expensive model handles.
pub trait ModelProvider {
    type Detector: Detector;
    type Embedder: Embedder;

    fn build_detector(&self) -> Result<Self::Detector, ModelError>;
    fn build_embedder(&self) -> Result<Self::Embedder, ModelError>;
}

/// ONNX models loaded from a directory.
#[derive(Debug, Clone)]
pub struct OnnxModels {
    model_dir: PathBuf,
    detector: DetectorConfig,
    intra_threads: usize,
}

impl OnnxModels {
    pub fn new(model_dir: impl Into<PathBuf>, intra_threads: usize) -> Self {
        Self {
            model_dir: model_dir.into(),
            detector: DetectorConfig {
                intra_threads,
                ..DetectorConfig::default()
            },
            intra_threads,
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    fn path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

impl ModelProvider for OnnxModels {
    type Detector = MtcnnDetector;
    type Embedder = FaceNetEmbedder;

    fn build_detector(&self) -> Result<MtcnnDetector, ModelError> {
        Ok(MtcnnDetector::load(
            &self.path(PNET_FILE),
            &self.path(RNET_FILE),
            &self.path(ONET_FILE),
            self.detector.clone(),
        )?)
    }

    fn build_embedder(&self) -> Result<FaceNetEmbedder, ModelError> {
        Ok(FaceNetEmbedder::load(&self.path(FACENET_FILE), self.intra_threads)?)
    }
}

/// Initialize-once holder for the detector and embedder.
///
/// A failed build leaves the slot empty; the next demand tries again.
pub struct ModelCache<P: ModelProvider> {
    provider: P,
    detector: Option<P::Detector>,
    embedder: Option<P::Embedder>,
}

impl<P: ModelProvider> ModelCache<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            detector: None,
            embedder: None,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn is_initialized(&self) -> bool {
        self.detector.is_some() && self.embedder.is_some()
    }

    /// Build both models now instead of on the first request.
    pub fn initialize(&mut self) -> Result<(), ModelError> {
        self.models().map(|_| ())
    }

    pub fn get_detector(&mut self) -> Result<&mut P::Detector, ModelError> {
        let detector = match self.detector.take() {
            Some(detector) => detector,
            None => timed_build("detector", || self.provider.build_detector())?,
        };
        Ok(self.detector.insert(detector))
    }

    pub fn get_embedder(&mut self) -> Result<&mut P::Embedder, ModelError> {
        let embedder = match self.embedder.take() {
            Some(embedder) => embedder,
            None => timed_build("embedder", || self.provider.build_embedder())?,
        };
        Ok(self.embedder.insert(embedder))
    }

    /// Both handles at once, building whichever is missing.
    pub fn models(&mut self) -> Result<(&mut P::Detector, &mut P::Embedder), ModelError> {
        let detector = match self.detector.take() {
            Some(detector) => detector,
            None => timed_build("detector", || self.provider.build_detector())?,
        };
        let detector = self.detector.insert(detector);

        let embedder = match self.embedder.take() {
            Some(embedder) => embedder,
            None => timed_build("embedder", || self.provider.build_embedder())?,
        };
        let embedder = self.embedder.insert(embedder);

        Ok((detector, embedder))
    }
}

fn timed_build<T>(
    what: &str,
    build: impl FnOnce() -> Result<T, ModelError>,
) -> Result<T, ModelError> {
    tracing::info!(model = what, "loading model (first use)");
    let started = Instant::now();
    match build() {
        Ok(model) => {
            tracing::info!(
                model = what,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "model loaded"
            );
            Ok(model)
        }
        Err(e) => {
            tracing::error!(model = what, error = %e, "model load failed");
            Err(e)
        }
    }
}
