//! Recognition session: the per-frame state machine.
//!
//! Each frame is evaluated from scratch. The only thing carried between
//! frames is the last computed state, whose `Recognized` identity is what
//! an operator-confirmed access event gets attributed to.

use crate::error::AccessError;
use crate::events::AccessEventLog;
use crate::matcher::{AcceptancePolicy, Candidate, Matcher, Snapshot, Verdict};
use crate::store::EventStore;
use crate::types::{AccessEvent, Action, Embedding};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which detected face drives the retained identity when a frame has several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceSelection {
    /// The first face reported by the detector.
    #[default]
    First,
    /// The face whose nearest candidate has the lowest distance overall.
    Nearest,
    /// Only a frame with exactly one face can recognize anyone.
    Single,
}

impl FromStr for FaceSelection {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(FaceSelection::First),
            "nearest" => Ok(FaceSelection::Nearest),
            "single" => Ok(FaceSelection::Single),
            other => Err(AccessError::InvalidInput(format!(
                "unknown face selection {other:?} (expected first, nearest or single)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: AcceptancePolicy,
    pub selection: FaceSelection,
    /// Location label stamped on every access event.
    pub location: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            policy: AcceptancePolicy::default(),
            selection: FaceSelection::default(),
            location: "Main Entrance".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state")]
pub enum RecognitionState {
    /// No face in the last frame.
    Idle,
    /// Faces present, classification in progress. Never left standing
    /// after `on_frame` returns.
    Detecting { faces: usize },
    Recognized { candidate: Candidate },
    /// Nearest candidate at or above threshold, or nothing enrolled.
    Unknown { nearest: Option<Candidate> },
}

impl RecognitionState {
    pub fn name(&self) -> &'static str {
        match self {
            RecognitionState::Idle => "Idle",
            RecognitionState::Detecting { .. } => "Detecting",
            RecognitionState::Recognized { .. } => "Recognized",
            RecognitionState::Unknown { .. } => "Unknown",
        }
    }
}

pub struct RecognitionSession {
    matcher: Matcher,
    config: SessionConfig,
    state: RecognitionState,
    /// Per-face verdicts of the last frame, in detector order.
    verdicts: Vec<Verdict>,
}

impl RecognitionSession {
    pub fn new(matcher: Matcher, config: SessionConfig) -> Self {
        Self {
            matcher,
            config,
            state: RecognitionState::Idle,
            verdicts: Vec::new(),
        }
    }

    pub fn state(&self) -> &RecognitionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Verdict for every face of the last frame, for display.
    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    /// Identity an access event would currently be attributed to.
    pub fn current_identity(&self) -> Option<&Candidate> {
        match &self.state {
            RecognitionState::Recognized { candidate } => Some(candidate),
            _ => None,
        }
    }

    /// Swap in a new registry snapshot.
    ///
    /// Candidates that are no longer in the snapshot are dropped from the
    /// state and from the per-face verdicts, so neither events nor status
    /// can point at a removed identity.
    pub fn reload(&mut self, snapshot: Snapshot) {
        self.matcher.reload(snapshot);
        let current = self.matcher.snapshot();
        let gone = |c: &Candidate| !current.contains_internal_id(c.internal_id);

        match &self.state {
            RecognitionState::Recognized { candidate } if gone(candidate) => {
                tracing::info!(
                    student_id = %candidate.student_id,
                    "retained identity left the registry"
                );
                self.state = RecognitionState::Unknown { nearest: None };
            }
            RecognitionState::Unknown { nearest: Some(candidate) } if gone(candidate) => {
                self.state = RecognitionState::Unknown { nearest: None };
            }
            _ => {}
        }

        for verdict in &mut self.verdicts {
            let stale = match &*verdict {
                Verdict::Recognized(c) | Verdict::Unknown(Some(c)) => gone(c),
                Verdict::Unknown(None) => false,
            };
            if stale {
                *verdict = Verdict::Unknown(None);
            }
        }
    }

    /// Evaluate one frame's worth of face embeddings.
    ///
    /// On error (a malformed probe) the session is left `Unknown` with no
    /// retained identity.
    pub fn on_frame(&mut self, embeddings: &[Embedding]) -> Result<&RecognitionState, AccessError> {
        if embeddings.is_empty() {
            self.verdicts.clear();
            self.transition(RecognitionState::Idle);
            return Ok(&self.state);
        }

        self.state = RecognitionState::Detecting {
            faces: embeddings.len(),
        };

        let results: Vec<_> = embeddings.iter().map(|e| self.matcher.nearest(e)).collect();
        self.verdicts = results
            .iter()
            .map(|r| match r {
                Ok(candidate) => self.config.policy.classify(candidate.clone()),
                Err(_) => Verdict::Unknown(None),
            })
            .collect();

        let selected = match self.select(&results) {
            Ok(selected) => selected,
            Err(err) => {
                tracing::warn!(error = %err, "frame probe rejected");
                self.transition(RecognitionState::Unknown { nearest: None });
                return Err(err);
            }
        };

        let next = match self.config.policy.classify(selected) {
            Verdict::Recognized(candidate) => RecognitionState::Recognized { candidate },
            Verdict::Unknown(nearest) => RecognitionState::Unknown { nearest },
        };
        self.transition(next);
        Ok(&self.state)
    }

    /// Record an access event for the currently recognized identity.
    ///
    /// Fails with `NoCurrentIdentity` unless the session is `Recognized`.
    /// The session state is never changed by this call.
    pub fn confirm_access_event<E: EventStore>(
        &self,
        log: &mut AccessEventLog<E>,
        action: Action,
    ) -> Result<AccessEvent, AccessError> {
        let candidate = self.current_identity().ok_or(AccessError::NoCurrentIdentity)?;
        log.record(
            Some(candidate.internal_id),
            &candidate.student_id,
            &candidate.display_name,
            action,
            &self.config.location,
        )
    }

    fn select(
        &self,
        results: &[Result<Option<Candidate>, AccessError>],
    ) -> Result<Option<Candidate>, AccessError> {
        match self.config.selection {
            FaceSelection::First => results[0].clone(),
            FaceSelection::Single if results.len() > 1 => {
                tracing::debug!(faces = results.len(), "several faces in frame; not selecting");
                Ok(None)
            }
            FaceSelection::Single => results[0].clone(),
            FaceSelection::Nearest => {
                let mut best: Option<Candidate> = None;
                let mut first_err = None;
                for result in results {
                    match result {
                        Ok(Some(c)) => {
                            if best.as_ref().map_or(true, |b| c.distance < b.distance) {
                                best = Some(c.clone());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            first_err.get_or_insert_with(|| e.clone());
                        }
                    }
                }
                match (best, first_err) {
                    (Some(c), _) => Ok(Some(c)),
                    (None, Some(e)) => Err(e),
                    (None, None) => Ok(None),
                }
            }
        }
    }

    fn transition(&mut self, next: RecognitionState) {
        if self.state.name() != next.name() {
            tracing::debug!(from = self.state.name(), to = next.name(), "session state");
        }
        self.state = next;
    }
}
