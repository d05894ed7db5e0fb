use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use vigil_core::{CascadeParams, PatternKind};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(
        "replay inference cannot analyse live camera {device}: use a directory source \
         or set allow_replay_with_camera"
    )]
    ReplayWithCamera { device: String },
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// V4L2 webcam.
    Camera { device: String },
    /// Still images replayed from a directory.
    Directory {
        path: PathBuf,
        #[serde(default = "default_fps")]
        fps: u32,
    },
}

fn default_fps() -> u32 {
    15
}


/// Detection loop tuning. The timing constants are empirical defaults, not
/// derived values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Minimum face detector confidence.
    pub min_face_confidence: f32,
    /// Euclidean distance at or above which a face is unknown.
    pub match_threshold: f32,
    /// Pause between face passes (one display frame).
    pub face_cycle_pause_ms: u64,
    /// Object/pattern pass interval.
    pub object_interval_ms: u64,
    /// Quiet period between object/pattern log appends.
    pub log_debounce_ms: u64,
    /// Buffer flush interval.
    pub flush_interval_ms: u64,
    pub fire: CascadeParams,
    pub gun: CascadeParams,
    /// Hand records buffered before stop to the sink in one last batch.
    pub flush_on_stop: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_face_confidence: 0.5,
            match_threshold: vigil_core::gallery::DEFAULT_MATCH_THRESHOLD,
            face_cycle_pause_ms: 16,
            object_interval_ms: 10,
            log_debounce_ms: 1000,
            flush_interval_ms: 2000,
            fire: CascadeParams {
                scale_factor: 1.2,
                min_neighbors: 17,
            },
            gun: CascadeParams {
                scale_factor: 1.2,
                min_neighbors: 3,
            },
            flush_on_stop: true,
        }
    }
}

impl PipelineSettings {
    pub fn face_cycle_pause(&self) -> Duration {
        Duration::from_millis(self.face_cycle_pause_ms)
    }

    pub fn object_interval(&self) -> Duration {
        Duration::from_millis(self.object_interval_ms.max(1))
    }

    pub fn log_debounce(&self) -> Duration {
        Duration::from_millis(self.log_debounce_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Cascade parameters for each trained pattern, in classifier call order.
    pub fn pattern_profiles(&self) -> [(PatternKind, CascadeParams); 2] {
        [(PatternKind::Fire, self.fire), (PatternKind::Gun, self.gun)]
    }
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `VIGIL_CONFIG`, then `VIGIL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account whose gallery is loaded and whose id is stamped on every event.
    pub owner_id: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Recorded inference script driving the replay models.
    pub replay_script: PathBuf,
    /// Replay outputs are keyed by frame sequence, not frame content, so
    /// pairing them with a live camera logs events that never happened.
    /// Only for exercising capture hardware.
    pub allow_replay_with_camera: bool,
    pub source: SourceConfig,
    pub pipeline: PipelineSettings,
    /// Start monitoring as soon as the daemon is up.
    pub autostart: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            owner_id: "unknown".to_string(),
            db_path: data_dir.join("events.db"),
            replay_script: data_dir.join("replay.json"),
            allow_replay_with_camera: false,
            source: SourceConfig::Directory {
                path: data_dir.join("frames"),
                fps: default_fps(),
            },
            pipeline: PipelineSettings::default(),
            autostart: false,
        }
    }
}

impl Config {
    /// Load configuration from the environment and validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("VIGIL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Refuse replay inference against a live camera unless explicitly
    /// allowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let SourceConfig::Camera { device } = &self.source else {
            return Ok(());
        };
        if !self.allow_replay_with_camera {
            return Err(ConfigError::ReplayWithCamera {
                device: device.clone(),
            });
        }
        tracing::warn!(
            device = %device,
            script = %self.replay_script.display(),
            "replay inference paired with a live camera; logged events follow the script, not the scene"
        );
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `VIGIL_*` variables fetched through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(owner) = lookup("VIGIL_OWNER_ID") {
            self.owner_id = owner;
        }
        if let Some(path) = lookup("VIGIL_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("VIGIL_REPLAY_SCRIPT") {
            self.replay_script = PathBuf::from(path);
        }
        if let Some(device) = lookup("VIGIL_CAMERA_DEVICE") {
            self.source = SourceConfig::Camera { device };
        }
        if let Some(path) = lookup("VIGIL_FRAME_DIR") {
            let fps = env_parse(&lookup, "VIGIL_FRAME_FPS").unwrap_or_else(default_fps);
            self.source = SourceConfig::Directory {
                path: PathBuf::from(path),
                fps,
            };
        }

        let p = &mut self.pipeline;
        override_with(&mut p.min_face_confidence, env_parse(&lookup, "VIGIL_MIN_FACE_CONFIDENCE"));
        override_with(&mut p.match_threshold, env_parse(&lookup, "VIGIL_MATCH_THRESHOLD"));
        override_with(&mut p.face_cycle_pause_ms, env_parse(&lookup, "VIGIL_FACE_CYCLE_PAUSE_MS"));
        override_with(&mut p.object_interval_ms, env_parse(&lookup, "VIGIL_OBJECT_INTERVAL_MS"));
        override_with(&mut p.log_debounce_ms, env_parse(&lookup, "VIGIL_LOG_DEBOUNCE_MS"));
        override_with(&mut p.flush_interval_ms, env_parse(&lookup, "VIGIL_FLUSH_INTERVAL_MS"));
        if let Some(v) = lookup("VIGIL_FLUSH_ON_STOP") {
            p.flush_on_stop = v != "0";
        }
        if let Some(v) = lookup("VIGIL_AUTOSTART") {
            self.autostart = v != "0";
        }
        if let Some(v) = lookup("VIGIL_ALLOW_REPLAY_WITH_CAMERA") {
            self.allow_replay_with_camera = v != "0";
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}
