//! Enrollment: one face in the current frame becomes one identity.

use crate::error::AccessError;
use crate::registry::IdentityRegistry;
use crate::session::RecognitionSession;
use crate::store::IdentityStore;
use crate::types::{Embedding, EnrollmentForm, IdentitySummary};

#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollmentService {
    /// Refuse frames with more than one face instead of taking the first.
    strict_single_face: bool,
}

impl EnrollmentService {
    pub fn new(strict_single_face: bool) -> Self {
        Self { strict_single_face }
    }

    /// Enroll the face found in the current frame under `form`.
    ///
    /// On success the session's matcher is reloaded from the registry so
    /// the new identity is matchable on the next frame. A duplicate student
    /// id leaves both the registry and the matcher untouched.
    pub fn enroll<S: IdentityStore>(
        &self,
        registry: &IdentityRegistry<S>,
        session: &mut RecognitionSession,
        faces: &[Embedding],
        form: &EnrollmentForm,
    ) -> Result<IdentitySummary, AccessError> {
        let embedding = self.pick_face(faces)?;

        if let Some(field) = form.first_blank_field() {
            return Err(AccessError::IncompleteInput(field));
        }

        let summary = registry.enroll(form, embedding.clone())?;

        match registry.load_all() {
            Ok(snapshot) => session.reload(snapshot),
            Err(err) => {
                // Committed but not yet matchable; the next reload picks it up.
                tracing::warn!(
                    error = %err,
                    student_id = %summary.student_id,
                    "matcher reload after enrollment failed"
                );
            }
        }

        Ok(summary)
    }

    fn pick_face<'a>(&self, faces: &'a [Embedding]) -> Result<&'a Embedding, AccessError> {
        match faces {
            [] => Err(AccessError::NoFaceDetected),
            [only] => Ok(only),
            [first, ..] if !self.strict_single_face => {
                tracing::debug!(faces = faces.len(), "several faces in frame; enrolling the first");
                Ok(first)
            }
            _ => Err(AccessError::MultipleFaces(faces.len())),
        }
    }
}
