//! turnstile-core: Biometric matching and access-event pipeline.
//!
//! Holds the identity registry, the nearest-neighbour matcher, enrollment,
//! the append-only access event log and the per-frame recognition session.
//! Face detection, encoding and storage engines plug in through the
//! [`FaceAnalyzer`], [`IdentityStore`] and [`EventStore`] seams.

pub mod analyzer;
pub mod enrollment;
pub mod error;
pub mod events;
pub mod matcher;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer};
pub use enrollment::EnrollmentService;
pub use error::AccessError;
pub use events::AccessEventLog;
pub use matcher::{AcceptancePolicy, Candidate, Matcher, Snapshot, Verdict, DEFAULT_THRESHOLD};
pub use registry::IdentityRegistry;
pub use session::{FaceSelection, RecognitionSession, RecognitionState, SessionConfig};
pub use store::{EventStore, IdentityStore, StoreError};
pub use types::{
    AccessEvent, Action, BoundingBox, DetectedFace, Embedding, EnrollmentForm, Identity,
    IdentitySummary, NewAccessEvent, NewIdentity,
};
