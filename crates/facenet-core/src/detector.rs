//! MTCNN face detector via ONNX Runtime.
//!
//! Runs the three-stage MTCNN cascade (P-Net proposals over an image pyramid,
//! R-Net refinement, O-Net output with landmarks), keeps the single largest
//! face and crops it with a margin to the canonical embedder input size.

use crate::geometry::{area_resize, to_channel_major};
use crate::types::{AlignedFace, Detection, FaceBox};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{s, Array3, Array4, ArrayView3, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const MTCNN_MEAN: f32 = 127.5;
const MTCNN_SCALE: f32 = 0.0078125;
const PNET_CELL_SIZE: f32 = 12.0;
const PNET_STRIDE: f32 = 2.0;
const PNET_SCALE_NMS_THRESHOLD: f32 = 0.5;
const CASCADE_NMS_THRESHOLD: f32 = 0.7;
const RNET_INPUT_SIZE: usize = 24;
const ONET_INPUT_SIZE: usize = 48;
const FACE_MEAN: f32 = 127.5;
const FACE_STD: f32 = 128.0;

/// Output channel counts used to tell the network heads apart.
const PROB_CHANNELS: usize = 2;
const REG_CHANNELS: usize = 4;
const LANDMARK_CHANNELS: usize = 10;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — export the MTCNN stages to ONNX and place them in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates a single face in an image and returns it aligned for embedding.
pub trait Detector {
    fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectorError>;
}

impl<T: Detector + ?Sized> Detector for Box<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectorError> {
        (**self).detect(image)
    }
}

/// Fixed MTCNN configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Side of the square aligned face handed to the embedder.
    pub image_size: u32,
    /// Margin in pixels (at `image_size` scale) added around the box.
    pub margin: u32,
    /// Confidence thresholds for P-Net, R-Net and O-Net.
    pub thresholds: [f32; 3],
    /// Smallest face side, in pixels, the pyramid is built to find.
    pub min_face_size: f32,
    /// Pyramid scale step.
    pub factor: f32,
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            image_size: 160,
            margin: 40,
            thresholds: [0.5, 0.6, 0.7],
            min_face_size: 20.0,
            factor: 0.709,
            intra_threads: 2,
        }
    }
}

/// Face proposal carried between cascade stages, in corner form.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    reg: [f32; 4],
    landmarks: Option<[(f32, f32); 5]>,
}

impl Candidate {
    fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            score,
            reg: [0.0; 4],
            landmarks: None,
        }
    }

    fn into_face_box(self) -> FaceBox {
        FaceBox {
            x: self.x1,
            y: self.y1,
            width: self.x2 - self.x1,
            height: self.y2 - self.y1,
            confidence: self.score,
            landmarks: self.landmarks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NmsMode {
    /// Intersection over union.
    Union,
    /// Intersection over the smaller box (inclusive pixel areas).
    Min,
}

/// One network output, copied out of the session.
struct NetTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Network heads, identified by channel count.
#[derive(Default)]
struct NetHeads {
    prob: Option<NetTensor>,
    reg: Option<NetTensor>,
    landmarks: Option<NetTensor>,
}

impl NetHeads {
    fn classify(tensors: Vec<NetTensor>) -> Self {
        let mut heads = NetHeads::default();
        for tensor in tensors {
            match tensor.shape.get(1).copied() {
                Some(PROB_CHANNELS) => heads.prob = Some(tensor),
                Some(REG_CHANNELS) => heads.reg = Some(tensor),
                Some(LANDMARK_CHANNELS) => heads.landmarks = Some(tensor),
                other => tracing::debug!(
                    ?other,
                    shape = ?tensor.shape,
                    "ignoring unrecognized MTCNN output"
                ),
            }
        }
        heads
    }

    fn require(
        tensor: Option<NetTensor>,
        stage: &str,
        head: &str,
    ) -> Result<NetTensor, DetectorError> {
        tensor.ok_or_else(|| {
            DetectorError::InferenceFailed(format!("{stage}: missing {head} output"))
        })
    }
}

/// MTCNN-based face detector.
pub struct MtcnnDetector {
    pnet: Session,
    rnet: Session,
    onet: Session,
    config: DetectorConfig,
}

impl MtcnnDetector {
    /// Load the three MTCNN stage models.
    pub fn load(
        pnet_path: &str,
        rnet_path: &str,
        onet_path: &str,
        config: DetectorConfig,
    ) -> Result<Self, DetectorError> {
        let pnet = load_session(pnet_path, "P-Net", config.intra_threads)?;
        let rnet = load_session(rnet_path, "R-Net", config.intra_threads)?;
        let onet = load_session(onet_path, "O-Net", config.intra_threads)?;

        tracing::info!(
            image_size = config.image_size,
            margin = config.margin,
            thresholds = ?config.thresholds,
            min_face_size = config.min_face_size,
            execution = "cpu",
            "MTCNN detector ready"
        );

        Ok(Self {
            pnet,
            rnet,
            onet,
            config,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run the full cascade, returning every surviving face box.
    pub fn detect_boxes(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (width, height) = image.dimensions();
        let pixels = to_channel_major(image);

        let candidates = self.propose(&pixels)?;
        tracing::debug!(count = candidates.len(), "P-Net proposals");
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.refine(&pixels, candidates, width, height)?;
        tracing::debug!(count = candidates.len(), "R-Net survivors");
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.output(&pixels, candidates, width, height)?;
        tracing::debug!(count = candidates.len(), "O-Net faces");

        Ok(candidates.into_iter().map(Candidate::into_face_box).collect())
    }

    /// Stage 1: fully convolutional P-Net over the image pyramid.
    fn propose(&mut self, pixels: &Array3<f32>) -> Result<Vec<Candidate>, DetectorError> {
        let (_, height, width) = pixels.dim();
        let threshold = self.config.thresholds[0];

        let mut all = Vec::new();
        for scale in pyramid_scales(width, height, self.config.min_face_size, self.config.factor) {
            let scaled_h = (height as f32 * scale + 1.0) as usize;
            let scaled_w = (width as f32 * scale + 1.0) as usize;
            let input = normalize_batch(vec![area_resize(pixels.view(), scaled_h, scaled_w)]);

            let heads = NetHeads::classify(run_net(&mut self.pnet, &input, "P-Net")?);
            let prob = NetHeads::require(heads.prob, "P-Net", "probability")?;
            let reg = NetHeads::require(heads.reg, "P-Net", "regression")?;

            let found = generate_candidates(&prob, &reg, scale, threshold)?;
            all.extend(nms(found, PNET_SCALE_NMS_THRESHOLD, NmsMode::Union));
        }

        let merged = nms(all, CASCADE_NMS_THRESHOLD, NmsMode::Union);
        Ok(merged
            .into_iter()
            .map(|c| {
                let w = c.x2 - c.x1;
                let h = c.y2 - c.y1;
                rerec(Candidate::new(
                    c.x1 + c.reg[0] * w,
                    c.y1 + c.reg[1] * h,
                    c.x2 + c.reg[2] * w,
                    c.y2 + c.reg[3] * h,
                    c.score,
                ))
            })
            .collect())
    }

    /// Stage 2: R-Net on 24×24 crops.
    fn refine(
        &mut self,
        pixels: &Array3<f32>,
        candidates: Vec<Candidate>,
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let (candidates, input) = crop_batch(pixels, candidates, width, height, RNET_INPUT_SIZE);
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let heads = NetHeads::classify(run_net(&mut self.rnet, &input, "R-Net")?);
        let prob = NetHeads::require(heads.prob, "R-Net", "probability")?;
        let reg = NetHeads::require(heads.reg, "R-Net", "regression")?;
        check_rows(&prob, candidates.len(), PROB_CHANNELS, "R-Net")?;
        check_rows(&reg, candidates.len(), REG_CHANNELS, "R-Net")?;

        let threshold = self.config.thresholds[1];
        let passed: Vec<Candidate> = candidates
            .into_iter()
            .enumerate()
            .filter_map(|(k, c)| {
                let score = prob.data[k * PROB_CHANNELS + 1];
                (score > threshold).then(|| Candidate {
                    score,
                    reg: std::array::from_fn(|i| reg.data[k * REG_CHANNELS + i]),
                    ..c
                })
            })
            .collect();

        Ok(nms(passed, CASCADE_NMS_THRESHOLD, NmsMode::Union)
            .into_iter()
            .map(|c| rerec(bbreg(c)))
            .collect())
    }

    /// Stage 3: O-Net on 48×48 crops, producing landmarks.
    fn output(
        &mut self,
        pixels: &Array3<f32>,
        candidates: Vec<Candidate>,
        width: u32,
        height: u32,
    ) -> Result<Vec<Candidate>, DetectorError> {
        let (candidates, input) = crop_batch(pixels, candidates, width, height, ONET_INPUT_SIZE);
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let heads = NetHeads::classify(run_net(&mut self.onet, &input, "O-Net")?);
        let prob = NetHeads::require(heads.prob, "O-Net", "probability")?;
        let reg = NetHeads::require(heads.reg, "O-Net", "regression")?;
        let points = NetHeads::require(heads.landmarks, "O-Net", "landmark")?;
        check_rows(&prob, candidates.len(), PROB_CHANNELS, "O-Net")?;
        check_rows(&reg, candidates.len(), REG_CHANNELS, "O-Net")?;
        check_rows(&points, candidates.len(), LANDMARK_CHANNELS, "O-Net")?;

        let threshold = self.config.thresholds[2];
        let passed: Vec<Candidate> = candidates
            .into_iter()
            .enumerate()
            .filter_map(|(k, c)| {
                let score = prob.data[k * PROB_CHANNELS + 1];
                if score <= threshold {
                    return None;
                }
                let w = c.x2 - c.x1 + 1.0;
                let h = c.y2 - c.y1 + 1.0;
                let row = &points.data[k * LANDMARK_CHANNELS..(k + 1) * LANDMARK_CHANNELS];
                let landmarks = std::array::from_fn(|i| {
                    (w * row[i] + c.x1 - 1.0, h * row[i + 5] + c.y1 - 1.0)
                });
                Some(bbreg(Candidate {
                    score,
                    reg: std::array::from_fn(|i| reg.data[k * REG_CHANNELS + i]),
                    landmarks: Some(landmarks),
                    ..c
                }))
            })
            .collect();

        Ok(nms(passed, CASCADE_NMS_THRESHOLD, NmsMode::Min))
    }
}

impl Detector for MtcnnDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Detection, DetectorError> {
        let boxes = self.detect_boxes(image)?;
        let Some(bbox) = select_largest(boxes) else {
            return Ok(Detection::NotFound);
        };

        match extract_face(image, &bbox, self.config.image_size, self.config.margin) {
            Some(face) => Ok(Detection::Found { face, bbox }),
            None => {
                tracing::debug!(?bbox, "face box collapsed after clamping to the image");
                Ok(Detection::NotFound)
            }
        }
    }
}

fn load_session(
    model_path: &str,
    stage: &str,
    intra_threads: usize,
) -> Result<Session, DetectorError> {
    if !Path::new(model_path).exists() {
        return Err(DetectorError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(intra_threads)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        stage,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded MTCNN stage"
    );

    Ok(session)
}

/// Run one network and copy every output tensor out of the session.
fn run_net(
    session: &mut Session,
    input: &Array4<f32>,
    stage: &str,
) -> Result<Vec<NetTensor>, DetectorError> {
    let output_count = session.outputs().len();
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

    let mut tensors = Vec::with_capacity(output_count);
    for idx in 0..output_count {
        let (shape, data) = outputs[idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("{stage} output {idx}: {e}")))?;
        tensors.push(NetTensor {
            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
            data: data.to_vec(),
        });
    }
    Ok(tensors)
}

fn check_rows(
    tensor: &NetTensor,
    rows: usize,
    channels: usize,
    stage: &str,
) -> Result<(), DetectorError> {
    if tensor.data.len() < rows * channels {
        return Err(DetectorError::InferenceFailed(format!(
            "{stage}: expected {rows}×{channels} values, got {}",
            tensor.data.len()
        )));
    }
    Ok(())
}

/// Stack raw-pixel crops into a normalized NCHW batch.
fn normalize_batch(crops: Vec<Array3<f32>>) -> Array4<f32> {
    let views: Vec<ArrayView3<'_, f32>> = crops.iter().map(|c| c.view()).collect();
    let mut batch = ndarray::stack(Axis(0), &views)
        .unwrap_or_else(|_| Array4::zeros((0, 3, 0, 0)));
    batch.mapv_inplace(|p| (p - MTCNN_MEAN) * MTCNN_SCALE);
    batch
}

/// Scales of the P-Net image pyramid, largest first.
fn pyramid_scales(width: usize, height: usize, min_face_size: f32, factor: f32) -> Vec<f32> {
    let m = PNET_CELL_SIZE / min_face_size;
    let mut min_side = width.min(height) as f32 * m;
    let mut scale = m;
    let mut scales = Vec::new();
    while min_side >= PNET_CELL_SIZE {
        scales.push(scale);
        scale *= factor;
        min_side *= factor;
    }
    scales
}

/// Turn a P-Net probability map into candidate boxes in image coordinates.
fn generate_candidates(
    prob: &NetTensor,
    reg: &NetTensor,
    scale: f32,
    threshold: f32,
) -> Result<Vec<Candidate>, DetectorError> {
    let (map_h, map_w) = match prob.shape.as_slice() {
        [_, _, h, w] => (*h, *w),
        other => {
            return Err(DetectorError::InferenceFailed(format!(
                "P-Net: expected NCHW probability map, got {other:?}"
            )))
        }
    };
    let plane = map_h * map_w;
    if prob.data.len() < PROB_CHANNELS * plane || reg.data.len() < REG_CHANNELS * plane {
        return Err(DetectorError::InferenceFailed(format!(
            "P-Net: output size mismatch for {map_h}×{map_w} map"
        )));
    }

    let mut candidates = Vec::new();
    for y in 0..map_h {
        for x in 0..map_w {
            let offset = y * map_w + x;
            let score = prob.data[plane + offset];
            if score < threshold {
                continue;
            }
            let (bx, by) = (x as f32, y as f32);
            let mut candidate = Candidate::new(
                ((PNET_STRIDE * bx + 1.0) / scale).floor(),
                ((PNET_STRIDE * by + 1.0) / scale).floor(),
                ((PNET_STRIDE * bx + PNET_CELL_SIZE) / scale).floor(),
                ((PNET_STRIDE * by + PNET_CELL_SIZE) / scale).floor(),
                score,
            );
            candidate.reg = std::array::from_fn(|c| reg.data[c * plane + offset]);
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

/// Apply the regression offsets scaled by the inclusive box size.
fn bbreg(c: Candidate) -> Candidate {
    let w = c.x2 - c.x1 + 1.0;
    let h = c.y2 - c.y1 + 1.0;
    Candidate {
        x1: c.x1 + c.reg[0] * w,
        y1: c.y1 + c.reg[1] * h,
        x2: c.x2 + c.reg[2] * w,
        y2: c.y2 + c.reg[3] * h,
        ..c
    }
}

/// Expand a box to a square around its center.
fn rerec(c: Candidate) -> Candidate {
    let w = c.x2 - c.x1;
    let h = c.y2 - c.y1;
    let side = w.max(h);
    let x1 = c.x1 + w * 0.5 - side * 0.5;
    let y1 = c.y1 + h * 0.5 - side * 0.5;
    Candidate {
        x1,
        y1,
        x2: x1 + side,
        y2: y1 + side,
        ..c
    }
}

/// Integer crop window `(x, y, ex, ey)` with 1-based start, clamped to the image.
fn pad(c: &Candidate, width: u32, height: u32) -> (usize, usize, usize, usize) {
    let x = (c.x1.trunc() as i64).max(1);
    let y = (c.y1.trunc() as i64).max(1);
    let ex = (c.x2.trunc() as i64).min(width as i64);
    let ey = (c.y2.trunc() as i64).min(height as i64);
    (x as usize, y as usize, ex.max(0) as usize, ey.max(0) as usize)
}

/// Crop every candidate, resample to `size`×`size` and build the stage input.
/// Candidates whose window is empty after clamping are dropped.
fn crop_batch(
    pixels: &Array3<f32>,
    candidates: Vec<Candidate>,
    width: u32,
    height: u32,
    size: usize,
) -> (Vec<Candidate>, Array4<f32>) {
    let mut kept = Vec::with_capacity(candidates.len());
    let mut crops = Vec::with_capacity(candidates.len());

    for c in candidates {
        let (x, y, ex, ey) = pad(&c, width, height);
        if ey <= y - 1 || ex <= x - 1 {
            continue;
        }
        let window = pixels.slice(s![.., (y - 1)..ey, (x - 1)..ex]);
        crops.push(area_resize(window, size, size));
        kept.push(c);
    }

    (kept, normalize_batch(crops))
}

fn box_area(c: &Candidate, mode: NmsMode) -> f32 {
    match mode {
        NmsMode::Union => (c.x2 - c.x1).max(0.0) * (c.y2 - c.y1).max(0.0),
        NmsMode::Min => (c.x2 - c.x1 + 1.0).max(0.0) * (c.y2 - c.y1 + 1.0).max(0.0),
    }
}

/// Overlap between two candidates under the given NMS criterion.
fn overlap(a: &Candidate, b: &Candidate, mode: NmsMode) -> f32 {
    let inclusive = if mode == NmsMode::Min { 1.0 } else { 0.0 };
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1) + inclusive).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1) + inclusive).max(0.0);
    let inter = inter_w * inter_h;

    let denom = match mode {
        NmsMode::Union => box_area(a, mode) + box_area(b, mode) - inter,
        NmsMode::Min => box_area(a, mode).min(box_area(b, mode)),
    };
    if denom > 0.0 { inter / denom } else { 0.0 }
}

/// Non-Maximum Suppression: remove overlapping candidates, highest score first.
fn nms(mut candidates: Vec<Candidate>, threshold: f32, mode: NmsMode) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && overlap(&candidates[i], &candidates[j], mode) > threshold {
                suppressed[j] = true;
            }
        }
        keep.push(candidates[i].clone());
    }

    keep
}

/// Keep only the face with the largest box area.
fn select_largest(boxes: Vec<FaceBox>) -> Option<FaceBox> {
    boxes.into_iter().max_by(|a, b| {
        a.area()
            .partial_cmp(&b.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Crop the face box plus margin and resize it to `size`×`size`, standardized
/// to `(p - 127.5) / 128`.
fn extract_face(image: &RgbImage, bbox: &FaceBox, size: u32, margin: u32) -> Option<AlignedFace> {
    let (width, height) = image.dimensions();
    let inner = size as f32 - margin as f32;
    let (mx, my) = if inner > 0.0 {
        (margin as f32 * bbox.width / inner, margin as f32 * bbox.height / inner)
    } else {
        (0.0, 0.0)
    };

    let x1 = (bbox.x - mx / 2.0).max(0.0) as u32;
    let y1 = (bbox.y - my / 2.0).max(0.0) as u32;
    let x2 = (bbox.x + bbox.width + mx / 2.0).min(width as f32).max(0.0) as u32;
    let y2 = (bbox.y + bbox.height + my / 2.0).min(height as f32).max(0.0) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let crop = imageops::crop_imm(image, x1, y1, x2 - x1, y2 - y1).to_image();
    let resized = imageops::resize(&crop, size, size, FilterType::Triangle);

    let side = size as usize;
    let data = Array3::from_shape_fn((3, side, side), |(c, y, x)| {
        (resized.get_pixel(x as u32, y as u32)[c] as f32 - FACE_MEAN) / FACE_STD
    });
    AlignedFace::from_channel_major(data)
}
