//! turnstile-vision: Face detection (SCRFD) and encoding (ArcFace) via ONNX.
//!
//! [`OnnxAnalyzer`] is the production implementation of the core's
//! [`FaceAnalyzer`] seam.

pub mod detector;
pub mod encoder;

pub use detector::{DetectorError, FaceDetector};
pub use encoder::{EncoderError, FaceEncoder, ARCFACE_MATCH_DISTANCE};

use std::path::Path;
use turnstile_core::{AnalyzerError, DetectedFace, FaceAnalyzer};

const DETECTOR_MODEL: &str = "det_10g.onnx";
const ENCODER_MODEL: &str = "w600k_r50.onnx";

/// Detector and encoder loaded from one model directory.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    encoder: FaceEncoder,
    /// Upper bound on faces encoded per frame, most confident first.
    max_faces: usize,
}

impl OnnxAnalyzer {
    pub fn load(model_dir: &Path, max_faces: usize) -> Result<Self, AnalyzerError> {
        let detector_path = model_dir.join(DETECTOR_MODEL);
        let encoder_path = model_dir.join(ENCODER_MODEL);

        let detector = FaceDetector::load(&detector_path.to_string_lossy())
            .map_err(|e| AnalyzerError::Failed(e.to_string()))?;
        let encoder = FaceEncoder::load(&encoder_path.to_string_lossy())
            .map_err(|e| AnalyzerError::Failed(e.to_string()))?;

        Ok(Self {
            detector,
            encoder,
            max_faces: max_faces.max(1),
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn embedding_dim(&self) -> usize {
        self.encoder.dim()
    }

    fn match_threshold(&self) -> f32 {
        ARCFACE_MATCH_DISTANCE
    }

    fn analyze(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let regions = self
            .detector
            .detect(frame, width, height)
            .map_err(|e| AnalyzerError::Failed(e.to_string()))?;

        let mut faces = Vec::with_capacity(regions.len().min(self.max_faces));
        for region in regions.into_iter().take(self.max_faces) {
            match self.encoder.encode(frame, width, height, &region) {
                Ok(embedding) => faces.push(DetectedFace { region, embedding }),
                Err(EncoderError::EmptyCrop) => {
                    tracing::debug!(?region, "skipping face outside frame");
                }
                Err(e) => return Err(AnalyzerError::Failed(e.to_string())),
            }
        }
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::matcher::SnapshotEntry;
    use turnstile_core::{AcceptancePolicy, Embedding, Matcher, Snapshot, Verdict};

    /// Unit vector at cosine `c` from the first axis.
    fn at_cosine(c: f32) -> Embedding {
        let mut values = vec![0.0; encoder::EMBEDDING_DIM];
        values[0] = c;
        values[1] = (1.0 - c * c).sqrt();
        Embedding::new(values)
    }

    fn verdict_at(c: f32) -> Verdict {
        let enrolled = SnapshotEntry {
            student_id: "S1".into(),
            display_name: "Ada Lovelace".into(),
            internal_id: 1,
            embedding: at_cosine(1.0),
        };
        let matcher = Matcher::new(Snapshot::from_entries(
            encoder::EMBEDDING_DIM,
            vec![enrolled],
        ));
        let candidate = matcher.nearest(&at_cosine(c)).unwrap();
        AcceptancePolicy::new(ARCFACE_MATCH_DISTANCE).classify(candidate)
    }

    #[test]
    fn test_match_distance_is_cosine_040() {
        assert!((ARCFACE_MATCH_DISTANCE - (2.0f32 - 0.8).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_same_person_cosines_are_recognized() {
        for c in [0.45, 0.6, 0.7, 0.8, 0.99] {
            assert!(
                matches!(verdict_at(c), Verdict::Recognized(_)),
                "cosine {c} should be recognized"
            );
        }
    }

    #[test]
    fn test_low_cosine_is_unknown() {
        for c in [0.3, 0.0, -0.5] {
            assert!(
                matches!(verdict_at(c), Verdict::Unknown(Some(_))),
                "cosine {c} should be unknown"
            );
        }
    }
}
