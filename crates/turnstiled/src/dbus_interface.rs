use crate::engine::{EngineError, EngineHandle};
use serde::Serialize;
use turnstile_core::{AccessError, Action, EnrollmentForm};
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.turnstile.Access1";
pub const OBJECT_PATH: &str = "/org/turnstile/Access1";

/// D-Bus interface for the access point daemon.
///
/// Bus name: org.turnstile.Access1
/// Object path: /org/turnstile/Access1
///
/// Structured results are returned as JSON strings.
pub struct AccessService {
    engine: EngineHandle,
}

impl AccessService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.turnstile.Access1")]
impl AccessService {
    /// Enroll the face currently in front of the camera.
    async fn enroll(
        &self,
        student_id: &str,
        first_name: &str,
        last_name: &str,
        faculty: &str,
    ) -> fdo::Result<String> {
        tracing::info!(student_id, "enroll requested");
        let form = EnrollmentForm {
            student_id: student_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            faculty: faculty.to_string(),
        };
        let summary = self.engine.enroll(form).await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Log an `Entry` or `Exit` for the recognized identity.
    async fn confirm(&self, action: &str) -> fdo::Result<String> {
        let action: Action = action.parse().map_err(|e| to_fdo(EngineError::Access(e)))?;
        tracing::info!(%action, "confirm requested");
        let event = self.engine.confirm(action).await.map_err(to_fdo)?;
        to_json(&event)
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        to_json(&identities)
    }

    async fn remove_identity(&self, id: i64) -> fdo::Result<bool> {
        tracing::info!(id, "remove requested");
        self.engine.remove_identity(id).await.map_err(to_fdo)
    }

    async fn recent_events(&self, limit: u32) -> fdo::Result<String> {
        let events = self
            .engine
            .recent_events(limit as usize)
            .await
            .map_err(to_fdo)?;
        to_json(&events)
    }

    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

/// Map an engine failure onto a D-Bus error, prefixing the error kind so
/// clients can tell failures apart without parsing prose.
fn to_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Access(e) => {
            let message = format!("{}: {e}", e.kind());
            match e {
                AccessError::InvalidInput(_)
                | AccessError::IncompleteInput(_)
                | AccessError::InvalidAction(_) => fdo::Error::InvalidArgs(message),
                _ => fdo::Error::Failed(message),
            }
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encode reply: {e}")))
}
