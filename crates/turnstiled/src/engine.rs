use crate::config::Config;
use crate::store::SqliteStore;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use turnstile_core::matcher::SnapshotEntry;
use turnstile_core::{
    AccessError, AccessEvent, AccessEventLog, AcceptancePolicy, Action, AnalyzerError, Embedding,
    EnrollmentForm, EnrollmentService, EventStore, FaceAnalyzer, IdentityRegistry, IdentityStore,
    IdentitySummary, Matcher, RecognitionSession, RecognitionState, SessionConfig, Snapshot,
    StoreError, Verdict,
};
use turnstile_hw::{Camera, CameraError, FrameSource};
use turnstile_vision::OnnxAnalyzer;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine for the `Status` call.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub state: RecognitionState,
    /// Verdict for every face of the last evaluated frame.
    pub faces: Vec<Verdict>,
    pub enrolled: usize,
    pub threshold: f32,
    pub location: String,
    pub frames: u64,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        form: EnrollmentForm,
        reply: oneshot::Sender<Result<IdentitySummary, AccessError>>,
    },
    Confirm {
        action: Action,
        reply: oneshot::Sender<Result<AccessEvent, AccessError>>,
    },
    ListIdentities {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, AccessError>>,
    },
    RemoveIdentity {
        id: i64,
        reply: oneshot::Sender<Result<bool, AccessError>>,
    },
    RecentEvents {
        limit: usize,
        reply: oneshot::Sender<Result<Vec<AccessEvent>, AccessError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Enroll the face currently in front of the camera.
    pub async fn enroll(&self, form: EnrollmentForm) -> Result<IdentitySummary, EngineError> {
        Ok(self
            .request(|reply| EngineRequest::Enroll { form, reply })
            .await??)
    }

    /// Record an access event for the currently recognized identity.
    pub async fn confirm(&self, action: Action) -> Result<AccessEvent, EngineError> {
        Ok(self
            .request(|reply| EngineRequest::Confirm { action, reply })
            .await??)
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        Ok(self
            .request(|reply| EngineRequest::ListIdentities { reply })
            .await??)
    }

    /// Returns whether an identity was removed.
    pub async fn remove_identity(&self, id: i64) -> Result<bool, EngineError> {
        Ok(self
            .request(|reply| EngineRequest::RemoveIdentity { id, reply })
            .await??)
    }

    pub async fn recent_events(&self, limit: usize) -> Result<Vec<AccessEvent>, EngineError> {
        Ok(self
            .request(|reply| EngineRequest::RecentEvents { limit, reply })
            .await??)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Stop the tick loop and release the camera. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| EngineRequest::Shutdown { reply })
            .await
            .is_err()
        {
            tracing::debug!("engine already stopped");
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Owns the camera, analyzer, registry, event log and session.
///
/// Everything runs on one thread: each tick evaluates one frame, then
/// queued operator requests are answered before the next tick.
pub struct Engine<C, A, S, E> {
    camera: C,
    analyzer: A,
    registry: IdentityRegistry<S>,
    events: AccessEventLog<E>,
    session: RecognitionSession,
    enrollment: EnrollmentService,
    frames: u64,
}

impl<C, A, S, E> Engine<C, A, S, E>
where
    C: FrameSource,
    A: FaceAnalyzer,
    S: IdentityStore,
    E: EventStore,
{
    /// Build the engine and load the initial matcher snapshot.
    pub fn new(
        camera: C,
        analyzer: A,
        registry: IdentityRegistry<S>,
        events: AccessEventLog<E>,
        session_config: SessionConfig,
        enrollment: EnrollmentService,
    ) -> Result<Self, AccessError> {
        let snapshot = registry.load_all()?;
        tracing::info!(enrolled = snapshot.len(), dim = snapshot.dim(), "registry loaded");
        Ok(Self {
            camera,
            analyzer,
            registry,
            events,
            session: RecognitionSession::new(Matcher::new(snapshot), session_config),
            enrollment,
            frames: 0,
        })
    }

    #[cfg(test)]
    fn session(&self) -> &RecognitionSession {
        &self.session
    }

    /// Evaluate one frame. A failed read, a dark frame or an analyzer
    /// failure skips the tick and leaves the session as it was.
    pub fn tick(&mut self) {
        let Some(faces) = self.capture_faces() else {
            return;
        };
        self.frames += 1;
        // Probe errors are logged by the session and leave it Unknown.
        let _ = self.session.on_frame(&faces);
    }

    pub fn enroll(&mut self, form: &EnrollmentForm) -> Result<IdentitySummary, AccessError> {
        let faces = self.capture_faces().unwrap_or_default();
        self.enrollment
            .enroll(&self.registry, &mut self.session, &faces, form)
    }

    pub fn confirm(&mut self, action: Action) -> Result<AccessEvent, AccessError> {
        self.session.confirm_access_event(&mut self.events, action)
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, AccessError> {
        self.registry.list_all()
    }

    /// Remove an identity and drop it from the live matcher.
    ///
    /// If the registry cannot be reloaded the current snapshot is pruned
    /// instead, so the removed identity is never matched again.
    pub fn remove_identity(&mut self, id: i64) -> Result<bool, AccessError> {
        if !self.registry.remove(id)? {
            return Ok(false);
        }

        let snapshot = match self.registry.load_all() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, id, "reload after removal failed; pruning snapshot");
                let current = self.session.matcher().snapshot();
                Snapshot::from_entries(
                    current.dim(),
                    current
                        .iter()
                        .filter(|entry| entry.internal_id != id)
                        .cloned()
                        .collect::<Vec<SnapshotEntry>>(),
                )
            }
        };
        self.session.reload(snapshot);
        Ok(true)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<AccessEvent>, AccessError> {
        self.events.recent(limit)
    }

    pub fn status(&self) -> EngineStatus {
        let config = self.session.config();
        EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            state: self.session.state().clone(),
            faces: self.session.verdicts().to_vec(),
            enrolled: self.session.matcher().snapshot().len(),
            threshold: config.policy.threshold,
            location: config.location.clone(),
            frames: self.frames,
        }
    }

    /// Run the tick loop until shutdown or until every handle is dropped.
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>, tick: Duration) {
        tracing::info!(tick_ms = tick.as_millis() as u64, "engine thread started");
        loop {
            let started = Instant::now();
            self.tick();

            loop {
                match rx.try_recv() {
                    Ok(EngineRequest::Shutdown { reply }) => {
                        tracing::info!("engine stopping");
                        let _ = reply.send(());
                        return;
                    }
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::info!("all handles dropped; engine stopping");
                        return;
                    }
                }
            }

            if let Some(rest) = tick.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll { form, reply } => {
                let _ = reply.send(self.enroll(&form));
            }
            EngineRequest::Confirm { action, reply } => {
                let _ = reply.send(self.confirm(action));
            }
            EngineRequest::ListIdentities { reply } => {
                let _ = reply.send(self.list_identities());
            }
            EngineRequest::RemoveIdentity { id, reply } => {
                let _ = reply.send(self.remove_identity(id));
            }
            EngineRequest::RecentEvents { limit, reply } => {
                let _ = reply.send(self.recent_events(limit));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Grab a frame and return the embeddings of its faces, or `None`
    /// when there is no usable frame.
    fn capture_faces(&mut self) -> Option<Vec<Embedding>> {
        let frame = match self.camera.grab() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "camera read failed; no frame this tick");
                return None;
            }
        };
        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame skipped");
            return None;
        }

        match self.analyzer.analyze(&frame.data, frame.width, frame.height) {
            Ok(faces) => Some(faces.into_iter().map(|face| face.embedding).collect()),
            Err(err) => {
                tracing::warn!(error = %err, "face analysis failed; no frame this tick");
                None
            }
        }
    }
}

/// Move an engine onto its own OS thread and return a handle to it.
pub fn spawn<C, A, S, E>(
    engine: Engine<C, A, S, E>,
    tick: Duration,
) -> Result<EngineHandle, EngineError>
where
    C: FrameSource + Send + 'static,
    A: FaceAnalyzer + Send + 'static,
    S: IdentityStore + Send + 'static,
    E: EventStore + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    std::thread::Builder::new()
        .name("turnstile-engine".into())
        .spawn(move || engine.run(rx, tick))
        .map_err(EngineError::Spawn)?;
    Ok(EngineHandle { tx })
}

/// Open the camera, load the models and the database, then start the engine.
///
/// Fails fast if the camera or either model is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(
        &config.camera_device,
        config.capture_width,
        config.capture_height,
    )?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let analyzer = OnnxAnalyzer::load(&config.model_dir, config.max_faces)?;
    tracing::info!(
        dir = %config.model_dir.display(),
        dim = analyzer.embedding_dim(),
        "face models loaded"
    );

    let registry = IdentityRegistry::new(
        SqliteStore::open(&config.db_path)?,
        analyzer.embedding_dim(),
    );
    let events = AccessEventLog::new(SqliteStore::open(&config.db_path)?);
    tracing::info!(path = %config.db_path.display(), "database opened");

    let session_config = session_config(config, analyzer.match_threshold());
    tracing::info!(
        threshold = session_config.policy.threshold,
        configured = config.threshold.is_some(),
        "acceptance threshold"
    );
    let engine = Engine::new(
        camera,
        analyzer,
        registry,
        events,
        session_config,
        EnrollmentService::new(config.strict_enrollment),
    )?;

    spawn(engine, Duration::from_millis(config.tick_ms))
}

/// Session settings from the config, falling back to `analyzer_threshold`
/// when no threshold is configured.
fn session_config(config: &Config, analyzer_threshold: f32) -> SessionConfig {
    SessionConfig {
        policy: AcceptancePolicy::new(config.effective_threshold(analyzer_threshold)),
        selection: config.face_selection,
        location: config.location.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use turnstile_core::store::memory::MemoryStore;
    use turnstile_core::{BoundingBox, DetectedFace, FaceSelection};
    use turnstile_hw::Frame;

    /// Camera returning scripted frames, then failing.
    struct ScriptedCamera {
        frames: VecDeque<Result<Frame, CameraError>>,
    }

    impl FrameSource for ScriptedCamera {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            self.frames
                .pop_front()
                .unwrap_or_else(|| Err(CameraError::CaptureFailed("script exhausted".into())))
        }
    }

    /// Analyzer returning one scripted face list per analyzed frame.
    struct ScriptedAnalyzer {
        dim: usize,
        outputs: VecDeque<Vec<Vec<f32>>>,
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn embedding_dim(&self) -> usize {
            self.dim
        }

        fn analyze(
            &mut self,
            _frame: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, AnalyzerError> {
            let faces = self.outputs.pop_front().unwrap_or_default();
            Ok(faces
                .into_iter()
                .map(|values| DetectedFace {
                    region: BoundingBox {
                        x: 0.0,
                        y: 0.0,
                        width: 1.0,
                        height: 1.0,
                        confidence: 0.9,
                    },
                    embedding: Embedding::new(values),
                })
                .collect())
        }
    }

    fn lit() -> Result<Frame, CameraError> {
        Ok(Frame::from_gray(vec![128; 4], 2, 2, 0))
    }

    fn dark() -> Result<Frame, CameraError> {
        Ok(Frame::from_gray(vec![0; 4], 2, 2, 0))
    }

    fn form(student_id: &str) -> EnrollmentForm {
        EnrollmentForm {
            student_id: student_id.into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            faculty: "Mathematics".into(),
        }
    }

    type TestEngine = Engine<ScriptedCamera, ScriptedAnalyzer, MemoryStore, MemoryStore>;

    fn engine(
        store: &MemoryStore,
        frames: Vec<Result<Frame, CameraError>>,
        outputs: Vec<Vec<Vec<f32>>>,
    ) -> TestEngine {
        Engine::new(
            ScriptedCamera {
                frames: frames.into(),
            },
            ScriptedAnalyzer {
                dim: 3,
                outputs: outputs.into(),
            },
            IdentityRegistry::new(store.clone(), 3),
            AccessEventLog::new(store.clone()),
            SessionConfig::default(),
            EnrollmentService::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_enroll_then_recognize_then_confirm() {
        let store = MemoryStore::new();
        let mut engine = engine(
            &store,
            vec![lit(), lit()],
            vec![vec![vec![0.0, 0.0, 0.0]], vec![vec![0.0, 0.0, 0.1]]],
        );

        let summary = engine.enroll(&form("S1")).unwrap();
        assert_eq!(summary.student_id, "S1");
        assert_eq!(engine.status().enrolled, 1);

        engine.tick();
        assert_eq!(engine.session().state().name(), "Recognized");

        let event = engine.confirm(Action::Entry).unwrap();
        assert_eq!(event.student_id, "S1");
        assert_eq!(event.identity_id, Some(summary.id));
        assert_eq!(event.location, "Main Entrance");
        assert_eq!(engine.recent_events(10).unwrap(), vec![event]);
    }

    #[test]
    fn test_enroll_without_face() {
        let store = MemoryStore::new();
        let mut engine = engine(&store, vec![lit()], vec![vec![]]);
        assert_eq!(engine.enroll(&form("S1")), Err(AccessError::NoFaceDetected));

        // Camera exhausted: a failed read cannot enroll either.
        assert_eq!(engine.enroll(&form("S1")), Err(AccessError::NoFaceDetected));
        assert_eq!(store.identity_count(), 0);
    }

    #[test]
    fn test_failed_read_and_dark_frame_keep_state() {
        let store = MemoryStore::new();
        let mut engine = engine(
            &store,
            vec![lit(), lit(), dark()],
            vec![vec![vec![0.0, 0.0, 0.0]], vec![vec![0.0, 0.0, 0.1]]],
        );
        engine.enroll(&form("S1")).unwrap();
        engine.tick();
        assert_eq!(engine.session().state().name(), "Recognized");

        engine.tick(); // dark
        engine.tick(); // camera exhausted
        assert_eq!(engine.session().state().name(), "Recognized");
        assert_eq!(engine.status().frames, 1);
    }

    #[test]
    fn test_empty_frame_clears_identity() {
        let store = MemoryStore::new();
        let mut engine = engine(
            &store,
            vec![lit(), lit(), lit()],
            vec![
                vec![vec![0.0, 0.0, 0.0]],
                vec![vec![0.0, 0.0, 0.1]],
                vec![],
            ],
        );
        engine.enroll(&form("S1")).unwrap();
        engine.tick();
        engine.tick();

        assert_eq!(engine.session().state(), &RecognitionState::Idle);
        assert_eq!(
            engine.confirm(Action::Exit),
            Err(AccessError::NoCurrentIdentity)
        );
        assert_eq!(store.event_count(), 0);
    }

    #[test]
    fn test_remove_identity_clears_retained_candidate() {
        let store = MemoryStore::new();
        let mut engine = engine(
            &store,
            vec![lit(), lit()],
            vec![vec![vec![0.0, 0.0, 0.0]], vec![vec![0.0, 0.0, 0.1]]],
        );
        let summary = engine.enroll(&form("S1")).unwrap();
        engine.tick();

        assert!(engine.remove_identity(summary.id).unwrap());
        assert!(!engine.remove_identity(summary.id).unwrap());
        assert_eq!(engine.status().enrolled, 0);
        assert_eq!(
            engine.confirm(Action::Entry),
            Err(AccessError::NoCurrentIdentity)
        );
        assert!(engine.list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_remove_with_store_down_keeps_snapshot() {
        let store = MemoryStore::new();
        let mut engine = engine(
            &store,
            vec![lit(), lit()],
            vec![vec![vec![0.0, 0.0, 0.0]], vec![vec![1.0, 1.0, 1.0]]],
        );
        let first = engine.enroll(&form("S1")).unwrap();
        engine.enroll(&form("S2")).unwrap();

        store.set_unavailable(true);
        assert!(matches!(
            engine.remove_identity(first.id),
            Err(AccessError::StorageUnavailable(_))
        ));
        assert_eq!(engine.status().enrolled, 2);

        store.set_unavailable(false);
        assert!(engine.remove_identity(first.id).unwrap());
        assert_eq!(engine.status().enrolled, 1);
    }

    #[test]
    fn test_status_reports_per_face_verdicts() {
        let store = MemoryStore::new();
        let mut engine = Engine::new(
            ScriptedCamera {
                frames: vec![lit(), lit()].into(),
            },
            ScriptedAnalyzer {
                dim: 3,
                outputs: vec![
                    vec![vec![0.0, 0.0, 0.0]],
                    vec![vec![5.0, 5.0, 5.0], vec![0.0, 0.0, 0.1]],
                ]
                .into(),
            },
            IdentityRegistry::new(store.clone(), 3),
            AccessEventLog::new(store.clone()),
            SessionConfig {
                selection: FaceSelection::Nearest,
                ..SessionConfig::default()
            },
            EnrollmentService::default(),
        )
        .unwrap();
        engine.enroll(&form("S1")).unwrap();
        engine.tick();

        let status = engine.status();
        assert_eq!(status.state.name(), "Recognized");
        assert_eq!(status.faces.len(), 2);
        assert!(matches!(status.faces[0], Verdict::Unknown(Some(_))));
        assert!(matches!(status.faces[1], Verdict::Recognized(_)));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"]["state"], "Recognized");
        assert_eq!(json["location"], "Main Entrance");
    }

    #[tokio::test]
    async fn test_handle_round_trip_and_shutdown() {
        let store = MemoryStore::new();
        let engine = engine(&store, vec![lit()], vec![vec![vec![0.0, 0.0, 0.0]]]);
        let handle = spawn(engine, Duration::from_millis(1)).unwrap();

        // The first tick consumes the only frame; enrollment sees no camera.
        let err = handle.enroll(form("S1")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Access(AccessError::NoFaceDetected)
        ));
        assert!(matches!(
            handle.recent_events(0).await,
            Err(EngineError::Access(AccessError::InvalidInput(_)))
        ));
        assert!(handle.list_identities().await.unwrap().is_empty());

        handle.shutdown().await;
        handle.shutdown().await;
        assert!(matches!(handle.status().await, Err(EngineError::ChannelClosed)));
    }

    #[test]
    fn test_daemon_threshold_defaults_to_analyzer_calibration() {
        let config = Config::default();
        let arcface = session_config(&config, turnstile_vision::ARCFACE_MATCH_DISTANCE);
        assert_eq!(arcface.policy.threshold, turnstile_vision::ARCFACE_MATCH_DISTANCE);
        assert_eq!(arcface.location, "Main Entrance");

        let scripted = ScriptedAnalyzer {
            dim: 3,
            outputs: VecDeque::new(),
        };
        let fallback = session_config(&config, scripted.match_threshold());
        assert_eq!(fallback.policy.threshold, turnstile_core::DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_configured_threshold_wins() {
        let config = Config {
            threshold: Some(0.45),
            ..Config::default()
        };
        let session = session_config(&config, turnstile_vision::ARCFACE_MATCH_DISTANCE);
        assert_eq!(session.policy.threshold, 0.45);
    }
}
