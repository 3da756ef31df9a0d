use facenet_core::models::ModelError;
use facenet_core::pipeline::PipelineError;
use facenet_core::{ModelCache, ModelProvider, Recognition};
use image::RgbImage;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Model(#[from] ModelError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("inference panicked: {0}")]
    Panicked(String),
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Recognize {
        image: RgbImage,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request recognition: downscale, detect over all augmentation angles,
    /// embed and aggregate.
    ///
    /// Waits for a queue slot when the engine is saturated.
    pub async fn recognize(&self, image: RgbImage) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the model cache, so every inference call is serialized
/// and each model is built exactly once. With `preload` set the models are
/// built here, before the handle is returned, and a load failure is fatal.
pub fn spawn_engine<P>(
    mut cache: ModelCache<P>,
    max_image_side: u32,
    queue_depth: usize,
    preload: bool,
) -> Result<EngineHandle, EngineError>
where
    P: ModelProvider + Send + 'static,
    P::Detector: Send + 'static,
    P::Embedder: Send + 'static,
{
    if preload {
        cache.initialize()?;
        tracing::info!("models preloaded");
    } else {
        tracing::info!("models will load on first request");
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("facenet-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { image, reply } => {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_recognize(&mut cache, image, max_image_side)
                        }))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            tracing::error!(%message, "recognition panicked, engine continues");
                            Err(EngineError::Panicked(message))
                        });
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_recognize<P: ModelProvider>(
    cache: &mut ModelCache<P>,
    image: RgbImage,
    max_image_side: u32,
) -> Result<Recognition, EngineError> {
    let started = Instant::now();
    let image = facenet_core::resize_if_needed(image, max_image_side);
    let (detector, embedder) = cache.models()?;
    let recognition = facenet_core::recognize(detector, embedder, &image)?;

    tracing::debug!(
        width = image.width(),
        height = image.height(),
        found = matches!(recognition, Recognition::Found { .. }),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recognition finished"
    );
    Ok(recognition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        face_image, uniform_image, BrokenModels, FakeModels, PanickingModels, EMBEDDING_DIM,
    };

    #[tokio::test]
    async fn test_recognize_face() {
        let engine = spawn_engine(ModelCache::new(FakeModels::default()), 720, 4, false).unwrap();
        match engine.recognize(face_image(200, 200)).await.unwrap() {
            Recognition::Found { embedding, angles_detected } => {
                assert_eq!(embedding.dim(), EMBEDDING_DIM);
                assert_eq!(angles_detected, 3);
            }
            Recognition::NotFound => panic!("expected a face"),
        }
    }

    #[tokio::test]
    async fn test_recognize_uniform_image_not_found() {
        let engine = spawn_engine(ModelCache::new(FakeModels::default()), 720, 4, false).unwrap();
        let result = engine.recognize(uniform_image(200, 200)).await.unwrap();
        assert!(matches!(result, Recognition::NotFound));
    }

    #[tokio::test]
    async fn test_models_built_once_across_requests() {
        let models = FakeModels::default();
        let builds = models.builds.clone();
        let engine = spawn_engine(ModelCache::new(models), 720, 4, false).unwrap();
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 0);

        let requests = (0..4).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.recognize(face_image(120, 120)).await })
        });
        for handle in requests.collect::<Vec<_>>() {
            handle.await.unwrap().unwrap();
        }
        // One detector build plus one embedder build.
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preload_builds_before_serving() {
        let models = FakeModels::default();
        let builds = models.builds.clone();
        let _engine = spawn_engine(ModelCache::new(models), 720, 4, true).unwrap();
        assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preload_failure_is_fatal() {
        let result = spawn_engine(ModelCache::new(BrokenModels), 720, 4, true);
        assert!(matches!(result, Err(EngineError::Model(_))));
    }

    #[tokio::test]
    async fn test_lazy_load_failure_reported_per_request() {
        let engine = spawn_engine(ModelCache::new(BrokenModels), 720, 4, false).unwrap();
        let err = engine.recognize(face_image(64, 64)).await.unwrap_err();
        assert!(matches!(err, EngineError::Model(_)));
    }

    #[tokio::test]
    async fn test_large_input_downscaled_before_detection() {
        let models = FakeModels::default();
        let seen = models.seen.clone();
        let engine = spawn_engine(ModelCache::new(models), 720, 4, false).unwrap();
        engine.recognize(face_image(2000, 1000)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (720, 360));
    }

    #[tokio::test]
    async fn test_deterministic_embeddings() {
        let engine = spawn_engine(ModelCache::new(FakeModels::default()), 720, 4, false).unwrap();
        let first = engine.recognize(face_image(160, 120)).await.unwrap();
        let second = engine.recognize(face_image(160, 120)).await.unwrap();
        match (first, second) {
            (
                Recognition::Found { embedding: a, .. },
                Recognition::Found { embedding: b, .. },
            ) => {
                for (x, y) in a.values.iter().zip(&b.values) {
                    assert!((x - y).abs() < 1e-6);
                }
            }
            _ => panic!("expected faces in both runs"),
        }
    }

    #[tokio::test]
    async fn test_engine_survives_panicking_inference() {
        let engine = spawn_engine(ModelCache::new(PanickingModels), 720, 4, false).unwrap();
        for _ in 0..2 {
            let err = engine.recognize(face_image(64, 64)).await.unwrap_err();
            assert!(
                matches!(err, EngineError::Panicked(ref msg) if msg.contains("detector exploded")),
                "{err}"
            );
        }
    }
}
