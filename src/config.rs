use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app_dirs::AppDirs;

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    pub mime_type: String,
    pub timeslice_ms: u64,
    pub stop_timeout_ms: u64,
    pub consent_probe_ms: u64,
    pub ffmpeg_path: String,
    pub display_args: Vec<String>,
    pub camera_args: Vec<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            mime_type: "video/webm;codecs=vp9".to_string(),
            timeslice_ms: 1000,
            stop_timeout_ms: 5000,
            consent_probe_ms: 750,
            ffmpeg_path: "ffmpeg".to_string(),
            display_args: strings(&[
                "-loglevel", "error", "-f", "x11grab", "-framerate", "15", "-i", ":0.0", "-an",
                "-c:v", "libvpx-vp9", "-deadline", "realtime", "-b:v", "1M", "-f", "webm",
                "pipe:1",
            ]),
            camera_args: strings(&[
                "-loglevel", "error", "-f", "v4l2", "-framerate", "15", "-i", "/dev/video0",
                "-an", "-c:v", "libvpx-vp9", "-deadline", "realtime", "-b:v", "1M", "-f", "webm",
                "pipe:1",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub api_token: Option<String>,
    pub tick_ms: u64,
    pub journal_path: Option<PathBuf>,
    pub capture: CaptureSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000/api".to_string(),
            api_token: None,
            tick_ms: 1000,
            journal_path: None,
            capture: CaptureSettings::default(),
        }
    }
}

impl Config {
    /// Journal location: explicit override, else the state directory.
    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .or_else(AppDirs::journal_path)
            .unwrap_or_else(|| PathBuf::from("proctype_journal.db"))
    }
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = AppDirs::config_path().unwrap_or_else(|| PathBuf::from("proctype_config.json"));
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        if let Ok(bytes) = fs::read(&self.path) {
            match serde_json::from_slice::<Config>(&bytes) {
                Ok(cfg) => return cfg,
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable config"),
            }
        }
        Config::default()
    }

    fn save(&self, cfg: &Config) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}
