//! Seam to the face detection and encoding collaborator.

use crate::matcher::DEFAULT_THRESHOLD;
use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("face analysis failed: {0}")]
    Failed(String),
}

/// Turns a grayscale frame into zero or more faces with embeddings.
///
/// Implementations report faces in a stable order (the detector's own
/// ranking) and always produce embeddings of [`embedding_dim`](Self::embedding_dim)
/// values.
pub trait FaceAnalyzer {
    fn embedding_dim(&self) -> usize;

    /// Acceptance distance calibrated for this analyzer's embeddings.
    fn match_threshold(&self) -> f32 {
        DEFAULT_THRESHOLD
    }

    fn analyze(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<DetectedFace>, AnalyzerError>;
}
