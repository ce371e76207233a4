//! Persistence seams for identities and access events.
//!
//! The core never talks to a storage engine directly. The daemon provides
//! SQLite-backed implementations; [`memory::MemoryStore`] backs tests.

use crate::error::AccessError;
use crate::types::{AccessEvent, Identity, IdentitySummary, NewAccessEvent, NewIdentity};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("duplicate student id: {0}")]
    Duplicate(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AccessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => AccessError::DuplicateIdentity(id),
            StoreError::Unavailable(msg) => AccessError::StorageUnavailable(msg),
        }
    }
}

/// Durable home of enrolled identities.
pub trait IdentityStore {
    /// Write a new identity, returning its internal id.
    ///
    /// Must fail with [`StoreError::Duplicate`] and write nothing when the
    /// student id is already present.
    fn create(&self, identity: &NewIdentity) -> Result<i64, StoreError>;

    /// Every identity that carries an embedding.
    fn read_all_with_embedding(&self) -> Result<Vec<Identity>, StoreError>;

    /// Every identity without its embedding, newest (highest id) first.
    fn read_summaries(&self) -> Result<Vec<IdentitySummary>, StoreError>;

    /// Delete by internal id. Returns whether a row existed.
    fn delete(&self, id: i64) -> Result<bool, StoreError>;
}

/// Append-only home of access events.
pub trait EventStore {
    /// Append an event and return it with its assigned id.
    fn append(&self, event: NewAccessEvent) -> Result<AccessEvent, StoreError>;

    /// Up to `limit` events, most recent first.
    fn read_recent(&self, limit: usize) -> Result<Vec<AccessEvent>, StoreError>;
}

pub mod memory {
    use super::*;
    use std::sync::{Arc, Mutex, MutexGuard};

    #[derive(Default)]
    struct Inner {
        identities: Vec<Identity>,
        events: Vec<AccessEvent>,
        next_identity_id: i64,
        next_event_id: i64,
        unavailable: bool,
    }

    /// In-process store implementing both seams over shared state.
    ///
    /// Clones share the same data, so one clone can back the registry and
    /// another the event log. Removing an identity detaches its events the
    /// way a `ON DELETE SET NULL` reference would.
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        inner: Arc<Mutex<Inner>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent call fail with `Unavailable` (or recover).
        pub fn set_unavailable(&self, unavailable: bool) {
            self.lock_unchecked().unavailable = unavailable;
        }

        pub fn identity_count(&self) -> usize {
            self.lock_unchecked().identities.len()
        }

        pub fn event_count(&self) -> usize {
            self.lock_unchecked().events.len()
        }

        fn lock_unchecked(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
            let guard = self.lock_unchecked();
            if guard.unavailable {
                return Err(StoreError::Unavailable("memory store offline".into()));
            }
            Ok(guard)
        }
    }

    impl IdentityStore for MemoryStore {
        fn create(&self, identity: &NewIdentity) -> Result<i64, StoreError> {
            let mut inner = self.lock()?;
            let student_id = &identity.form.student_id;
            if inner.identities.iter().any(|i| &i.student_id == student_id) {
                return Err(StoreError::Duplicate(student_id.clone()));
            }
            inner.next_identity_id += 1;
            let id = inner.next_identity_id;
            inner.identities.push(Identity {
                id,
                student_id: student_id.clone(),
                first_name: identity.form.first_name.clone(),
                last_name: identity.form.last_name.clone(),
                faculty: identity.form.faculty.clone(),
                embedding: Some(identity.embedding.clone()),
                created_at: identity.created_at,
            });
            Ok(id)
        }

        fn read_all_with_embedding(&self) -> Result<Vec<Identity>, StoreError> {
            let inner = self.lock()?;
            Ok(inner
                .identities
                .iter()
                .filter(|i| i.embedding.is_some())
                .cloned()
                .collect())
        }

        fn read_summaries(&self) -> Result<Vec<IdentitySummary>, StoreError> {
            let inner = self.lock()?;
            let mut summaries: Vec<_> = inner.identities.iter().map(Identity::summary).collect();
            summaries.sort_by(|a, b| b.id.cmp(&a.id));
            Ok(summaries)
        }

        fn delete(&self, id: i64) -> Result<bool, StoreError> {
            let mut inner = self.lock()?;
            let before = inner.identities.len();
            inner.identities.retain(|i| i.id != id);
            let removed = inner.identities.len() != before;
            if removed {
                for event in inner.events.iter_mut().filter(|e| e.identity_id == Some(id)) {
                    event.identity_id = None;
                }
            }
            Ok(removed)
        }
    }

    impl EventStore for MemoryStore {
        fn append(&self, event: NewAccessEvent) -> Result<AccessEvent, StoreError> {
            let mut inner = self.lock()?;
            inner.next_event_id += 1;
            let stored = AccessEvent::from_new(inner.next_event_id, event);
            inner.events.push(stored.clone());
            Ok(stored)
        }

        fn read_recent(&self, limit: usize) -> Result<Vec<AccessEvent>, StoreError> {
            let inner = self.lock()?;
            let mut events = inner.events.clone();
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
            events.truncate(limit);
            Ok(events)
        }
    }
}
