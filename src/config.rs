use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub debug: bool,
}

fn default_source() -> String {
    "0".to_string()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            debug: false,
        }
    }
}

fn default_working_width() -> i32 {
    640
}

fn default_working_height() -> i32 {
    480
}

fn default_blur_kernel() -> i32 {
    21
}

fn default_pixel_threshold() -> f64 {
    25.0
}

fn default_min_area() -> f64 {
    500.0
}

fn default_confirm_frames() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    #[serde(default = "default_working_width")]
    pub working_width: i32,
    #[serde(default = "default_working_height")]
    pub working_height: i32,
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: i32,
    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: f64,
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    #[serde(default = "default_confirm_frames")]
    pub confirm_frames: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            working_width: default_working_width(),
            working_height: default_working_height(),
            blur_kernel: default_blur_kernel(),
            pixel_threshold: default_pixel_threshold(),
            min_area: default_min_area(),
            confirm_frames: default_confirm_frames(),
        }
    }
}

fn default_detector_model() -> String {
    "models/yolo26n.onnx".to_string()
}

fn default_target_class() -> String {
    "bird".to_string()
}

fn default_detector_confidence() -> f32 {
    0.4
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Local path or http(s) URL of the ONNX model.
    #[serde(default = "default_detector_model")]
    pub model: String,
    #[serde(default = "default_target_class")]
    pub target_class: String,
    #[serde(default = "default_detector_confidence")]
    pub min_confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: default_detector_model(),
            target_class: default_target_class(),
            min_confidence: default_detector_confidence(),
        }
    }
}

fn default_classifier_model() -> String {
    "models/birds-efficientnet-b2.onnx".to_string()
}

fn default_classifier_labels() -> PathBuf {
    PathBuf::from("models/birds-labels.txt")
}

fn default_classifier_input_size() -> u32 {
    260
}

fn default_classifier_output() -> String {
    "logits".to_string()
}

fn default_floor() -> f32 {
    0.1
}

fn default_confirm() -> f32 {
    0.4
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_model")]
    pub model: String,
    #[serde(default = "default_classifier_labels")]
    pub labels: PathBuf,
    #[serde(default = "default_classifier_input_size")]
    pub input_size: u32,
    #[serde(default = "default_classifier_output")]
    pub output_name: String,
    /// Scores below this are noise and never stored.
    #[serde(default = "default_floor")]
    pub floor: f32,
    /// Scores at or above this are stored as confirmed matches.
    #[serde(default = "default_confirm")]
    pub confirm: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: default_classifier_model(),
            labels: default_classifier_labels(),
            input_size: default_classifier_input_size(),
            output_name: default_classifier_output(),
            floor: default_floor(),
            confirm: default_confirm(),
        }
    }
}

fn default_cooldown_secs() -> f64 {
    10.0
}

fn default_worker_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: f64,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
}

impl TriggerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            worker_timeout_secs: default_worker_timeout_secs(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("birdybird.db")
}

fn default_captures_dir() -> PathBuf {
    PathBuf::from("captures")
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_captures_dir")]
    pub captures_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            captures_dir: default_captures_dir(),
        }
    }
}

fn default_http_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        if !Path::new(DEFAULT_CONFIG_PATH).exists() {
            tracing::info!("no {} found, using defaults", DEFAULT_CONFIG_PATH);
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.motion.working_width <= 0 || self.motion.working_height <= 0 {
            return Err(ConfigError::Invalid(
                "motion working resolution must be non-zero".into(),
            ));
        }
        if self.motion.blur_kernel <= 0 || self.motion.blur_kernel % 2 == 0 {
            return Err(ConfigError::Invalid(
                "motion.blur_kernel must be a positive odd number".into(),
            ));
        }
        if self.motion.confirm_frames == 0 {
            return Err(ConfigError::Invalid(
                "motion.confirm_frames must be at least 1".into(),
            ));
        }
        if self.classifier.floor > self.classifier.confirm {
            return Err(ConfigError::Invalid(format!(
                "classifier.floor ({}) exceeds classifier.confirm ({})",
                self.classifier.floor, self.classifier.confirm
            )));
        }
        let cooldown = Duration::try_from_secs_f64(self.trigger.cooldown_secs).map_err(|_| {
            ConfigError::Invalid(format!(
                "trigger.cooldown_secs ({}) must be a non-negative, representable duration",
                self.trigger.cooldown_secs
            ))
        })?;
        if self.trigger.worker_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "trigger.worker_timeout_secs must be non-zero".into(),
            ));
        }
        // A run must be over before the next dispatch can be admitted.
        if self.trigger.worker_timeout() > cooldown {
            return Err(ConfigError::Invalid(format!(
                "trigger.worker_timeout_secs ({}) exceeds trigger.cooldown_secs ({})",
                self.trigger.worker_timeout_secs, self.trigger.cooldown_secs
            )));
        }
        Ok(())
    }
}
