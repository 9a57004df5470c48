use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::aggregate::{on_rounding_grid, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::api::DEFAULT_LISTEN_ADDR;
use crate::service::DEFAULT_MAX_UPLOAD_BYTES;

const DEFAULT_MODEL_PATH: &str = "models/best.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_DETECTOR_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
const DEFAULT_LABELS: [&str; 7] = [
    "bug", "level 1", "level 2", "level 3", "level 4", "level 5", "level 6",
];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServiceConfigFile {
    listen_addr: Option<String>,
    confidence_threshold: Option<f64>,
    staging_dir: Option<PathBuf>,
    max_upload_bytes: Option<usize>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou_threshold: Option<f32>,
    labels: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Scripted detections; decodes the image but runs no model.
    Stub,
    /// ONNX model executed with tract.
    Tract,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Stub => "stub",
            BackendKind::Tract => "tract",
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!(
                "unknown detector backend '{other}' (expected 'stub' or 'tract')"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: String,
    /// Default minimum confidence for a detection to be reported.
    pub confidence_threshold: f64,
    /// Where uploads are staged; the system temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: BackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    /// Pre-filter applied inside the detector, before NMS.
    pub min_confidence: f32,
    pub iou_threshold: f32,
    pub labels: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            staging_dir: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            detector: DetectorSettings::default(),
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Tract,
            model_path: Some(PathBuf::from(DEFAULT_MODEL_PATH)),
            input_size: DEFAULT_INPUT_SIZE,
            min_confidence: DEFAULT_DETECTOR_CONFIDENCE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the TOML file named by `PLANTI_CONFIG`, then `PLANTI_*`
    /// env overrides. The result is validated.
    pub fn load() -> Result<Self> {
        let cfg = Self::load_unchecked()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Same layering as [`load`](Self::load) without range checks, for
    /// callers that apply further overrides and then call `validate`.
    pub fn load_unchecked() -> Result<Self> {
        let config_path = std::env::var("PLANTI_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Result<Self> {
        let defaults = ServiceConfig::default();
        let detector_file = file.detector.unwrap_or_default();
        let backend = match detector_file.backend.as_deref() {
            Some(name) => name.parse()?,
            None => defaults.detector.backend,
        };
        let detector = DetectorSettings {
            backend,
            model_path: detector_file
                .model_path
                .or(defaults.detector.model_path),
            input_size: detector_file
                .input_size
                .unwrap_or(defaults.detector.input_size),
            min_confidence: detector_file
                .confidence
                .unwrap_or(defaults.detector.min_confidence),
            iou_threshold: detector_file
                .iou_threshold
                .unwrap_or(defaults.detector.iou_threshold),
            labels: detector_file.labels.unwrap_or(defaults.detector.labels),
        };
        Ok(Self {
            listen_addr: file.listen_addr.unwrap_or(defaults.listen_addr),
            confidence_threshold: file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            staging_dir: file.staging_dir,
            max_upload_bytes: file.max_upload_bytes.unwrap_or(defaults.max_upload_bytes),
            detector,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("PLANTI_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(threshold) = non_empty_env("PLANTI_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("PLANTI_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Some(dir) = non_empty_env("PLANTI_STAGING_DIR") {
            self.staging_dir = Some(PathBuf::from(dir));
        }
        if let Some(limit) = non_empty_env("PLANTI_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("PLANTI_MAX_UPLOAD_BYTES must be an integer byte count"))?;
        }
        if let Some(backend) = non_empty_env("PLANTI_BACKEND") {
            self.detector.backend = backend.parse()?;
        }
        if let Some(path) = non_empty_env("PLANTI_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Ok(labels) = std::env::var("PLANTI_LABELS") {
            let parsed = split_csv(&labels);
            if !parsed.is_empty() {
                self.detector.labels = parsed;
            }
        }
        Ok(())
    }

    /// Checks ranges and cross-field requirements. Binaries call this after
    /// applying command-line overrides to [`load_unchecked`](Self::load_unchecked).
    pub fn validate(&self) -> Result<()> {
        if !unit_interval(self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold must be between 0 and 1, got {}",
                self.confidence_threshold
            ));
        }
        if !on_rounding_grid(self.confidence_threshold) {
            return Err(anyhow!(
                "confidence_threshold may have at most 4 decimal places, got {}",
                self.confidence_threshold
            ));
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr '{}' is not a socket address", self.listen_addr))?;
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        if let Some(dir) = &self.staging_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(anyhow!(
                    "staging_dir {} is not a directory",
                    dir.display()
                ));
            }
        }
        self.detector.validate()
    }
}

impl DetectorSettings {
    fn validate(&self) -> Result<()> {
        if !unit_interval(self.min_confidence as f64) {
            return Err(anyhow!(
                "detector confidence must be between 0 and 1, got {}",
                self.min_confidence
            ));
        }
        if !(self.iou_threshold > 0.0 && self.iou_threshold <= 1.0) {
            return Err(anyhow!(
                "iou_threshold must be in (0, 1], got {}",
                self.iou_threshold
            ));
        }
        if self.input_size == 0 || self.input_size % 32 != 0 {
            return Err(anyhow!(
                "input_size must be a positive multiple of 32, got {}",
                self.input_size
            ));
        }
        // The tract backend can name classes from the model head instead.
        if self.labels.is_empty() && self.backend == BackendKind::Stub {
            return Err(anyhow!("the stub backend requires at least one class label"));
        }
        if self.backend == BackendKind::Tract && self.model_path.is_none() {
            return Err(anyhow!("the tract backend requires model_path"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn unit_interval(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_csv_drops_blank_entries() {
        assert_eq!(
            split_csv(" bug, level 1 ,,level 2, "),
            vec!["bug", "level 1", "level 2"]
        );
        assert!(split_csv(" , ").is_empty());
    }

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("Stub".parse::<BackendKind>().unwrap(), BackendKind::Stub);
        assert_eq!(" tract ".parse::<BackendKind>().unwrap(), BackendKind::Tract);
        assert!("onnxruntime".parse::<BackendKind>().is_err());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file: ServiceConfigFile = toml::from_str(
            r#"
            confidence_threshold = 0.5

            [detector]
            backend = "stub"
            labels = ["a", "b"]
            "#,
        )
        .unwrap();
        let cfg = ServiceConfig::from_file(file).unwrap();
        assert_eq!(cfg.confidence_threshold, 0.5);
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.detector.backend, BackendKind::Stub);
        assert_eq!(cfg.detector.labels, vec!["a", "b"]);
        assert_eq!(cfg.detector.input_size, DEFAULT_INPUT_SIZE);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_bad_detector_settings() {
        let mut settings = DetectorSettings::default();
        settings.input_size = 600;
        assert!(settings.validate().is_err());

        let mut settings = DetectorSettings::default();
        settings.iou_threshold = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = DetectorSettings::default();
        settings.model_path = None;
        assert!(settings.validate().is_err());
        settings.backend = BackendKind::Stub;
        settings.validate().unwrap();
    }

    #[test]
    fn empty_labels_only_allowed_for_tract() {
        let mut settings = DetectorSettings::default();
        settings.labels.clear();
        settings.validate().unwrap();
        settings.backend = BackendKind::Stub;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn threshold_must_sit_on_four_decimal_grid() {
        let mut cfg = ServiceConfig::default();
        cfg.confidence_threshold = 0.7002;
        cfg.validate().unwrap();
        cfg.confidence_threshold = 0.70002;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<ServiceConfigFile, _> =
            toml::from_str("listen_address = \"127.0.0.1:1\"");
        assert!(parsed.is_err());
    }
}
