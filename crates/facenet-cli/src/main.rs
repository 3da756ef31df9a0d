use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facenet_core::geometry::angle_view;
use facenet_core::preprocess::DEFAULT_MAX_SIDE;
use facenet_core::{Detection, Detector, ModelCache, OnnxModels, Recognition, AUGMENTATION_ANGLES};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facenet", about = "FaceNet face embedding CLI")]
struct Cli {
    /// Directory containing the ONNX model files
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Downscale images whose longest side exceeds this many pixels
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_SIDE)]
    max_side: u32,

    /// ONNX Runtime intra-op threads per model
    #[arg(long, global = true, default_value_t = 2)]
    threads: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the aggregated face embedding of an image as JSON
    Embed {
        /// Image file to process
        image: PathBuf,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },
    /// Report face detection at every augmentation angle
    Detect {
        /// Image file to process
        image: PathBuf,
    },
}

/// Same shape as the service's recognition response.
#[derive(Serialize)]
struct EmbedOutput {
    success: bool,
    embedding: Vec<f32>,
    embedding_size: usize,
    message: String,
}

impl From<Recognition> for EmbedOutput {
    fn from(recognition: Recognition) -> Self {
        match recognition {
            Recognition::Found { embedding, .. } => Self {
                success: true,
                embedding_size: embedding.dim(),
                embedding: embedding.values,
                message: String::new(),
            },
            Recognition::NotFound => Self {
                success: false,
                embedding: Vec::new(),
                embedding_size: 0,
                message: "No face detected".into(),
            },
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model_dir = cli.model_dir.unwrap_or_else(facenet_core::default_model_dir);
    let mut cache = ModelCache::new(OnnxModels::new(model_dir, cli.threads.max(1)));

    match cli.command {
        Commands::Embed { image, pretty } => {
            let image = load_image(&image, cli.max_side)?;
            let (detector, embedder) = cache.models()?;
            let output = EmbedOutput::from(facenet_core::recognize(detector, embedder, &image)?);
            let json = if pretty {
                serde_json::to_string_pretty(&output)?
            } else {
                serde_json::to_string(&output)?
            };
            println!("{json}");
        }
        Commands::Detect { image } => {
            let image = load_image(&image, cli.max_side)?;
            let detector = cache.get_detector()?;
            println!("input: {}x{}", image.width(), image.height());
            for angle in AUGMENTATION_ANGLES {
                let view = angle_view(&image, angle);
                match detector.detect(&view)? {
                    Detection::Found { bbox, .. } => println!(
                        "{angle:>+6.1}°  view {}x{}  face at ({:.0}, {:.0}) {:.0}x{:.0}  confidence {:.3}",
                        view.width(),
                        view.height(),
                        bbox.x,
                        bbox.y,
                        bbox.width,
                        bbox.height,
                        bbox.confidence
                    ),
                    Detection::NotFound => println!(
                        "{angle:>+6.1}°  view {}x{}  no face",
                        view.width(),
                        view.height()
                    ),
                }
            }
        }
    }

    Ok(())
}

fn load_image(path: &Path, max_side: u32) -> Result<image::RgbImage> {
    let image = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_rgb8();
    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "image loaded"
    );
    Ok(facenet_core::resize_if_needed(image, max_side))
}
