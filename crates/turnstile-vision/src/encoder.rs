//! ArcFace face encoder via ONNX Runtime.
//!
//! Crops the detected face (with a margin) out of the grayscale frame,
//! resizes it to the 112x112 network input and returns an L2-normalized
//! embedding.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;
use turnstile_core::{BoundingBox, Embedding};

const INPUT_SIZE: u32 = 112;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
/// Fraction of the box size added on every side before cropping.
const CROP_MARGIN: f32 = 0.1;
pub const EMBEDDING_DIM: usize = 512;
/// Euclidean distance between two unit embeddings at cosine similarity 0.40,
/// `sqrt(2 - 2 * 0.40)`.
pub const ARCFACE_MATCH_DISTANCE: f32 = 1.095_445_1;
const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEncoder {
    session: Session,
}

impl FaceEncoder {
    pub fn load(model_path: &str) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = model_path, dim = EMBEDDING_DIM, "loaded ArcFace model");

        Ok(Self { session })
    }

    pub fn dim(&self) -> usize {
        EMBEDDING_DIM
    }

    /// Compute the embedding of one detected face.
    pub fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, EncoderError> {
        let crop = crop_face(frame, width, height, face)?;
        let input = input_tensor(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}

/// Cut the face box plus margin out of the frame and scale it to the input size.
fn crop_face(
    frame: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
) -> Result<GrayImage, EncoderError> {
    let image = GrayImage::from_raw(width, height, frame.to_vec()).ok_or_else(|| {
        EncoderError::InferenceFailed(format!(
            "frame buffer of {} bytes does not hold {width}x{height} pixels",
            frame.len()
        ))
    })?;

    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x0 = (face.x - mx).max(0.0).floor() as u32;
    let y0 = (face.y - my).max(0.0).floor() as u32;
    let x1 = ((face.x + face.width + mx).ceil().max(0.0) as u32).min(width);
    let y1 = ((face.y + face.height + my).ceil().max(0.0) as u32).min(height);
    if x1 <= x0 || y1 <= y0 {
        return Err(EncoderError::EmptyCrop);
    }

    let crop = imageops::crop_imm(&image, x0, y0, x1 - x0, y1 - y0).to_image();
    Ok(imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle))
}

fn input_tensor(face: &GrayImage) -> Array4<f32> {
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        let value = (pixel[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = value;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_face_resizes_to_input() {
        let frame = vec![90u8; 200 * 100];
        let crop = crop_face(&frame, 200, 100, &face(50.0, 20.0, 40.0, 40.0)).unwrap();
        assert_eq!(crop.dimensions(), (INPUT_SIZE, INPUT_SIZE));
        assert!(crop.pixels().all(|p| p[0] == 90));
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let frame = vec![0u8; 64 * 64];
        assert!(crop_face(&frame, 64, 64, &face(-10.0, -10.0, 30.0, 30.0)).is_ok());
        assert!(matches!(
            crop_face(&frame, 64, 64, &face(100.0, 100.0, 10.0, 10.0)),
            Err(EncoderError::EmptyCrop)
        ));
    }

    #[test]
    fn test_input_tensor_channels_identical() {
        let face = GrayImage::from_pixel(INPUT_SIZE, INPUT_SIZE, image::Luma([128u8]));
        let tensor = input_tensor(&face);
        let expected = (128.0 - PIXEL_MEAN) / PIXEL_STD;
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        for c in 0..3 {
            assert!((tensor[[0, c, 5, 7]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
