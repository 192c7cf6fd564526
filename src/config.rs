use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

pub const CONFIG_PATH_ENV: &str = "ATTENDIFY_CONFIG";
pub const BACKEND_URL_ENV: &str = "ATTENDIFY_BACKEND_URL";
pub const STREAM_URL_ENV: &str = "ATTENDIFY_STREAM_URL";
pub const FRAMES_DIR_ENV: &str = "ATTENDIFY_FRAMES_DIR";

const STREAM_PATH: &str = "/api/face-recognition/ws";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One HTTP request per frame.
    Http,
    /// Persistent WebSocket channel.
    Stream,
    /// In-process embedding matcher fed by the reference manifest.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub base_url: String,
    pub stream_url: String,
    pub request_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Delay between reference manifest retries while the local matcher has
    /// no set loaded.
    pub manifest_retry_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Http,
            base_url: "http://localhost:8000".into(),
            stream_url: stream_url_for("http://localhost:8000"),
            request_timeout_ms: 5_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 15_000,
            manifest_retry_ms: 10_000,
        }
    }
}

impl BackendSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn manifest_retry(&self) -> Duration {
        Duration::from_millis(self.manifest_retry_ms.max(1))
    }
}

/// WebSocket endpoint on the same host as `base_url`.
fn stream_url_for(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let socket_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{socket_base}{STREAM_PATH}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    pub interval_ms: u64,
    /// Embedding distance at or above which a face is labelled unknown.
    pub match_threshold: f32,
    pub max_reference_images: usize,
    /// Consecutive cycles an identity must be seen before it is marked.
    pub confirmation_streak: u32,
    /// When set, each processed frame is saved here with its overlay drawn in.
    pub preview_path: Option<PathBuf>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            match_threshold: 0.6,
            max_reference_images: 5,
            confirmation_streak: 1,
            preview_path: None,
        }
    }
}

impl DetectionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnrollmentSettings {
    pub min_frames: usize,
    pub capture_interval_ms: u64,
    /// Minimum pHash Hamming distance between kept frames; 0 disables the check.
    pub min_pose_distance: u32,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            min_frames: 3,
            capture_interval_ms: 400,
            min_pose_distance: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct CameraSettings {
    pub frames_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendSettings,
    pub detection: DetectionSettings,
    pub enrollment: EnrollmentSettings,
    pub camera: CameraSettings,
    pub database_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            detection: DetectionSettings::default(),
            enrollment: EnrollmentSettings::default(),
            camera: CameraSettings::default(),
            database_path: PathBuf::from("attendify.sqlite3"),
        }
    }
}

impl AppConfig {
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(BACKEND_URL_ENV).filter(|value| !value.is_empty()) {
            self.backend.stream_url = stream_url_for(&url);
            self.backend.base_url = url;
        }
        if let Some(url) = lookup(STREAM_URL_ENV).filter(|value| !value.is_empty()) {
            self.backend.stream_url = url;
        }
        if let Some(dir) = lookup(FRAMES_DIR_ENV).filter(|value| !value.is_empty()) {
            self.camera.frames_dir = Some(PathBuf::from(dir));
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<AppConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            parse_config(&contents, &path)
        } else {
            AppConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> AppConfig {
        self.read().clone()
    }

    pub fn update(&self, config: AppConfig) -> Result<()> {
        let mut guard = self.write();
        self.persist(&config)?;
        *guard = config;
        Ok(())
    }

    fn persist(&self, data: &AppConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppConfig> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_config(contents: &str, path: &Path) -> AppConfig {
    match serde_json::from_str(contents) {
        Ok(config) => config,
        Err(err) => {
            log::warn!(
                "Ignoring unreadable config at {} ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}
