use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use turnstile_core::FaceSelection;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which D-Bus bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `TURNSTILE_CONFIG`, then `TURNSTILE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing the ONNX detector and encoder models.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face is recognized. `None` uses the
    /// analyzer's calibrated distance.
    pub threshold: Option<f32>,
    /// Period of the camera poll. Must be positive.
    pub tick_ms: u64,
    /// Location label stamped on access events.
    pub location: String,
    pub face_selection: FaceSelection,
    /// Refuse enrollment when more than one face is visible.
    pub strict_enrollment: bool,
    /// Most faces encoded per frame.
    pub max_faces: usize,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("access.db"),
            threshold: None,
            tick_ms: 30,
            location: "Main Entrance".to_string(),
            face_selection: FaceSelection::First,
            strict_enrollment: false,
            max_faces: 4,
            bus: BusKind::System,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("TURNSTILE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&src)
    }

    /// Parse a TOML file body. Well-typed but out-of-range values fall back
    /// to their defaults with a warning.
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(src)?;
        let defaults = Self::default();
        if config.tick_ms == 0 {
            tracing::warn!(key = "tick_ms", value = 0, "ignoring out-of-range setting");
            config.tick_ms = defaults.tick_ms;
        }
        if let Some(t) = config.threshold.filter(|t| !valid_threshold(t)) {
            tracing::warn!(key = "threshold", value = %t, "ignoring out-of-range setting");
            config.threshold = defaults.threshold;
        }
        if config.max_faces == 0 {
            tracing::warn!(key = "max_faces", value = 0, "ignoring out-of-range setting");
            config.max_faces = defaults.max_faces;
        }
        Ok(config)
    }

    /// Threshold to run with: the configured one, or `analyzer_default`.
    pub fn effective_threshold(&self, analyzer_default: f32) -> f32 {
        self.threshold.unwrap_or(analyzer_default)
    }

    /// Apply `TURNSTILE_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TURNSTILE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        override_parsed(&get, "TURNSTILE_CAPTURE_WIDTH", &mut self.capture_width);
        override_parsed(&get, "TURNSTILE_CAPTURE_HEIGHT", &mut self.capture_height);
        if let Some(v) = get("TURNSTILE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("TURNSTILE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(t) = parse_override(&get, "TURNSTILE_THRESHOLD", valid_threshold) {
            self.threshold = Some(t);
        }
        if let Some(ms) = parse_override(&get, "TURNSTILE_TICK_MS", |ms: &u64| *ms > 0) {
            self.tick_ms = ms;
        }
        if let Some(v) = get("TURNSTILE_LOCATION") {
            self.location = v;
        }
        override_parsed(&get, "TURNSTILE_FACE_SELECTION", &mut self.face_selection);
        if let Some(v) = get("TURNSTILE_STRICT_ENROLLMENT") {
            self.strict_enrollment = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(n) = parse_override(&get, "TURNSTILE_MAX_FACES", |n: &usize| *n > 0) {
            self.max_faces = n;
        }
        if let Some(v) = get("TURNSTILE_BUS") {
            match v.to_ascii_lowercase().as_str() {
                "system" => self.bus = BusKind::System,
                "session" => self.bus = BusKind::Session,
                other => tracing::warn!(value = other, "ignoring TURNSTILE_BUS"),
            }
        }
    }
}

fn override_parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(v) = parse_override(get, key, |_: &T| true) {
        *slot = v;
    }
}

/// Parse `key` and keep it only if `valid` accepts it.
fn parse_override<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(v) if valid(&v) => Some(v),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn valid_threshold(t: &f32) -> bool {
    t.is_finite() && *t > 0.0
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("turnstile")
}
