use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SITE: &str = "sitetest";
pub const DEFAULT_CLIENT: &str = "clienttest";
pub const DEFAULT_CONF_THRESHOLD: f64 = 0.0;
pub const DEFAULT_MODEL_PATH: &str = "yolov8n.pt";

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    camera_list: Option<Vec<CameraConfigFile>>,
    scan_interval: Option<IntervalValue>,
    site: Option<String>,
    client: Option<String>,
    filter_items: Option<Vec<String>>,
    conf_threshold: Option<f64>,
    ai_model_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    name: Option<String>,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// `scan_interval` arrives either as a number or as a numeric string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntervalValue {
    Int(i64),
    Text(String),
}

impl IntervalValue {
    fn seconds(&self) -> Result<u64, ConfigError> {
        let raw = match self {
            Self::Int(value) => *value,
            Self::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                ConfigError::invalid(format!("scan_interval '{}' is not an integer", text))
            })?,
        };
        if raw <= 0 {
            return Err(ConfigError::invalid(format!(
                "scan_interval must be positive, got {}",
                raw
            )));
        }
        Ok(raw as u64)
    }
}

/// One camera endpoint. Credentials are redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub name: String,
    pub url: String,
    pub username: String,
    pub password: String,
}

impl CameraConfig {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable pipeline snapshot. A reconfiguration builds a new one; scan cycles
/// hold the snapshot they started with.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub cameras: Vec<CameraConfig>,
    pub scan_interval_secs: u64,
    pub site: String,
    pub client: String,
    pub filter_classes: BTreeSet<String>,
    pub confidence_threshold: f64,
    pub model_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            site: DEFAULT_SITE.to_string(),
            client: DEFAULT_CLIENT.to_string(),
            filter_classes: BTreeSet::new(),
            confidence_threshold: DEFAULT_CONF_THRESHOLD,
            model_path: DEFAULT_MODEL_PATH.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Parse the inbound JSON configuration object, filling documented defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: PipelineConfigFile = serde_json::from_str(raw)?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Same as [`PipelineConfig::from_json`] for an already-decoded value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let file: PipelineConfigFile = serde_json::from_value(value)?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Result<Self, ConfigError> {
        let cameras = file
            .camera_list
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(idx, camera)| {
                let name = camera
                    .name
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| ConfigError::invalid(format!("camera #{} has no name", idx)))?;
                let url = camera.url.filter(|url| !url.trim().is_empty()).ok_or_else(|| {
                    ConfigError::invalid(format!("camera '{}' has no url", name))
                })?;
                Ok(CameraConfig {
                    name,
                    url,
                    username: camera.username.unwrap_or_default(),
                    password: camera.password.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let scan_interval_secs = match file.scan_interval {
            Some(value) => value.seconds()?,
            None => DEFAULT_SCAN_INTERVAL_SECS,
        };
        let confidence_threshold = file.conf_threshold.unwrap_or(DEFAULT_CONF_THRESHOLD);

        Ok(Self {
            cameras,
            scan_interval_secs,
            site: file.site.unwrap_or_else(|| DEFAULT_SITE.to_string()),
            client: file.client.unwrap_or_else(|| DEFAULT_CLIENT.to_string()),
            filter_classes: file.filter_items.unwrap_or_default().into_iter().collect(),
            confidence_threshold,
            model_path: file
                .ai_model_path
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
        })
    }

    /// Check the invariants a snapshot must hold before any timer uses it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::invalid("scan_interval must be positive"));
        }
        if !self.confidence_threshold.is_finite()
            || !(0.0..1.0).contains(&self.confidence_threshold)
        {
            return Err(ConfigError::invalid(format!(
                "conf_threshold must be in [0, 1), got {}",
                self.confidence_threshold
            )));
        }
        if self.model_path.trim().is_empty() {
            return Err(ConfigError::invalid("ai_model_path must not be empty"));
        }
        if self.site.trim().is_empty() || self.client.trim().is_empty() {
            return Err(ConfigError::invalid("site and client must not be empty"));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.name.trim().is_empty() || camera.url.trim().is_empty() {
                return Err(ConfigError::invalid("every camera needs a name and a url"));
            }
            if !seen.insert(camera.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate camera name '{}'",
                    camera.name
                )));
            }
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Namespace for saved frames: `<client>_<site>`.
    pub fn output_namespace(&self) -> String {
        format!("{}_{}", self.client, self.site)
    }

    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|camera| camera.name == name)
    }
}
