use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AccessError;

/// Bounding region of a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector produced by an external encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to another embedding of the same dimension.
    ///
    /// Returns `InvalidInput` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, AccessError> {
        if self.dim() != other.dim() {
            return Err(AccessError::dimension_mismatch(other.dim(), self.dim()));
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// One face found in a frame by the detector/encoder collaborator.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Direction of an access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Entry,
    Exit,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Entry => "Entry",
            Action::Exit => "Exit",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" | "in" => Ok(Action::Entry),
            "exit" | "out" => Ok(Action::Exit),
            _ => Err(AccessError::InvalidAction(s.to_string())),
        }
    }
}

/// Operator-supplied identity fields for a new enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollmentForm {
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub faculty: String,
}

impl EnrollmentForm {
    /// Copy of the form with every field trimmed.
    pub fn trimmed(&self) -> Self {
        Self {
            student_id: self.student_id.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            faculty: self.faculty.trim().to_string(),
        }
    }

    /// Name of the first blank field, if any.
    pub fn first_blank_field(&self) -> Option<&'static str> {
        [
            ("student_id", &self.student_id),
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("faculty", &self.faculty),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// A validated identity ready to be written by an identity store.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub form: EnrollmentForm,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// An enrolled identity as read back from the store, embedding included.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: i64,
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub faculty: String,
    pub embedding: Option<Embedding>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id,
            student_id: self.student_id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            faculty: self.faculty.clone(),
            created_at: self.created_at,
        }
    }
}

/// Identity without its embedding, for administrative listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: i64,
    pub student_id: String,
    pub first_name: String,
    pub last_name: String,
    pub faculty: String,
    pub created_at: DateTime<Utc>,
}

/// An access event before the event store has assigned its id.
#[derive(Debug, Clone)]
pub struct NewAccessEvent {
    pub identity_id: Option<i64>,
    pub student_id: String,
    pub display_name: String,
    pub action: Action,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

/// Immutable record of a recognition-driven entry or exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: i64,
    /// `None` once the identity has been removed from the registry.
    pub identity_id: Option<i64>,
    pub student_id: String,
    pub display_name: String,
    pub action: Action,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

impl AccessEvent {
    pub fn from_new(id: i64, event: NewAccessEvent) -> Self {
        Self {
            id,
            identity_id: event.identity_id,
            student_id: event.student_id,
            display_name: event.display_name,
            action: event.action,
            location: event.location,
            timestamp: event.timestamp,
        }
    }
}
