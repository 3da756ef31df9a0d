use facenet_core::preprocess::DEFAULT_MAX_SIDE;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on (default: 0.0.0.0:5001).
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Longest image side before the input is downscaled.
    pub max_image_side: u32,
    /// Recognition requests allowed to wait for the engine thread.
    pub queue_depth: usize,
    /// Maximum accepted request body size in bytes.
    pub max_upload_bytes: usize,
    /// Load both models before serving instead of on the first request.
    pub preload_models: bool,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from `FACENET_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACENET_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facenet_core::default_model_dir());

        let bind = std::env::var("FACENET_BIND")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "ignoring invalid FACENET_BIND");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 5001)));

        Self {
            bind,
            model_dir,
            max_image_side: env_parse("FACENET_MAX_IMAGE_SIDE", DEFAULT_MAX_SIDE),
            queue_depth: env_parse("FACENET_QUEUE_DEPTH", 4usize).max(1),
            max_upload_bytes: env_parse("FACENET_MAX_UPLOAD_BYTES", 16 * 1024 * 1024),
            preload_models: std::env::var("FACENET_PRELOAD_MODELS")
                .map(|v| v != "0")
                .unwrap_or(false),
            intra_threads: env_parse("FACENET_INTRA_THREADS", 2usize).max(1),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
