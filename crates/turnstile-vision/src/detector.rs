//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame into the square network input, decodes the
//! anchor-free box regressions of the three stride heads and removes
//! overlapping boxes with greedy NMS.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;
use turnstile_core::BoundingBox;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the scaled frame inside the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: usize,
    pad_y: usize,
    scaled_w: u32,
    scaled_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
        Self {
            scale,
            pad_x: (INPUT_SIZE - scaled_w as usize) / 2,
            pad_y: (INPUT_SIZE - scaled_h as usize) / 2,
            scaled_w,
            scaled_h,
        }
    }

    /// Map a point in network input space back to frame pixels.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor positions (score, bbox) for one stride head.
type HeadSlots = (usize, usize);

pub struct FaceDetector {
    session: Session,
    heads: [HeadSlots; 3],
}

impl FaceDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let heads = head_slots(&names);
        tracing::info!(path = model_path, outputs = ?names, ?heads, "loaded SCRFD model");

        Ok(Self { session, heads })
    }

    /// Detect faces in a grayscale frame, most confident first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let letterbox = Letterbox::fit(width, height);
        let input = input_tensor(frame, width, height, &letterbox)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.heads[head];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores, stride {stride}: {e}"))
            })?;
            let (_, boxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("boxes, stride {stride}: {e}"))
            })?;
            candidates.extend(decode_head(scores, boxes, stride, &letterbox));
        }

        Ok(suppress(candidates, NMS_IOU_THRESHOLD))
    }
}

/// Resize the frame into the letterbox and normalize into a 1x3xNxN tensor.
fn input_tensor(
    frame: &[u8],
    width: u32,
    height: u32,
    letterbox: &Letterbox,
) -> Result<Array4<f32>, DetectorError> {
    let image = GrayImage::from_raw(width, height, frame.to_vec()).ok_or_else(|| {
        DetectorError::InferenceFailed(format!(
            "frame buffer of {} bytes does not hold {width}x{height} pixels",
            frame.len()
        ))
    })?;
    let scaled = imageops::resize(
        &image,
        letterbox.scaled_w,
        letterbox.scaled_h,
        FilterType::Triangle,
    );

    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for (x, y, pixel) in scaled.enumerate_pixels() {
        let value = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let (tx, ty) = (x as usize + letterbox.pad_x, y as usize + letterbox.pad_y);
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = value;
        }
    }
    Ok(tensor)
}

/// Find (score, bbox) output positions by name, falling back to the
/// standard export order of scores 0-2 then boxes 3-5.
fn head_slots(names: &[String]) -> [HeadSlots; 3] {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut slots = [(0, 3), (1, 4), (2, 5)];
    for (head, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => slots[head] = (s, b),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    slots
}

/// Decode boxes above the score threshold for one stride head.
fn decode_head(scores: &[f32], boxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let cells_per_row = INPUT_SIZE / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > SCORE_THRESHOLD)
        .filter_map(|(anchor, &score)| {
            let offsets = boxes.get(anchor * 4..anchor * 4 + 4)?;
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * step;
            let cy = (cell / cells_per_row) as f32 * step;

            let (x1, y1) = letterbox.to_frame(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by confidence.
fn suppress(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
