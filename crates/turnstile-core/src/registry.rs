//! Identity registry: validated writes and snapshot loads over an [`IdentityStore`].

use crate::error::AccessError;
use crate::matcher::{Snapshot, SnapshotEntry};
use crate::store::IdentityStore;
use crate::types::{Embedding, EnrollmentForm, IdentitySummary, NewIdentity};
use chrono::Utc;

/// Owns enrolled identities. Every embedding it accepts has `dim` values.
pub struct IdentityRegistry<S> {
    store: S,
    dim: usize,
}

impl<S: IdentityStore> IdentityRegistry<S> {
    pub fn new(store: S, dim: usize) -> Self {
        Self { store, dim }
    }

    /// Fixed embedding dimension of this registry.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Validate and persist a new identity.
    ///
    /// Blank fields and wrong-dimension embeddings are rejected with
    /// `InvalidInput` before the store is touched. An existing student id
    /// fails with `DuplicateIdentity` and leaves the registry unchanged.
    pub fn enroll(
        &self,
        form: &EnrollmentForm,
        embedding: Embedding,
    ) -> Result<IdentitySummary, AccessError> {
        let form = form.trimmed();
        if let Some(field) = form.first_blank_field() {
            return Err(AccessError::InvalidInput(format!("{field} must not be empty")));
        }
        self.check_dim(&embedding)?;

        let identity = NewIdentity {
            form,
            embedding,
            created_at: Utc::now(),
        };
        let id = self.store.create(&identity)?;

        tracing::info!(
            id,
            student_id = %identity.form.student_id,
            faculty = %identity.form.faculty,
            "identity enrolled"
        );

        Ok(IdentitySummary {
            id,
            student_id: identity.form.student_id,
            first_name: identity.form.first_name,
            last_name: identity.form.last_name,
            faculty: identity.form.faculty,
            created_at: identity.created_at,
        })
    }

    /// Build a fresh matcher snapshot from every identity with an embedding.
    pub fn load_all(&self) -> Result<Snapshot, AccessError> {
        let identities = self.store.read_all_with_embedding()?;
        let mut entries = Vec::with_capacity(identities.len());

        for identity in identities {
            let display_name = identity.display_name();
            let Some(embedding) = identity.embedding else {
                continue;
            };
            if embedding.dim() != self.dim {
                return Err(AccessError::InvalidInput(format!(
                    "stored embedding for {} has dimension {}, registry expects {}",
                    identity.student_id,
                    embedding.dim(),
                    self.dim
                )));
            }
            entries.push(SnapshotEntry {
                student_id: identity.student_id,
                display_name,
                internal_id: identity.id,
                embedding,
            });
        }

        tracing::debug!(count = entries.len(), "registry snapshot loaded");
        Ok(Snapshot::from_entries(self.dim, entries))
    }

    /// Summaries of every identity, newest first.
    pub fn list_all(&self) -> Result<Vec<IdentitySummary>, AccessError> {
        Ok(self.store.read_summaries()?)
    }

    /// Remove an identity by internal id. Unknown ids are a no-op.
    pub fn remove(&self, id: i64) -> Result<bool, AccessError> {
        let removed = self.store.delete(id)?;
        if removed {
            tracing::info!(id, "identity removed");
        } else {
            tracing::debug!(id, "remove: no such identity");
        }
        Ok(removed)
    }

    fn check_dim(&self, embedding: &Embedding) -> Result<(), AccessError> {
        if embedding.dim() != self.dim {
            return Err(AccessError::dimension_mismatch(self.dim, embedding.dim()));
        }
        Ok(())
    }
}
