//! Reconciler configuration stored in `reconciler.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{builtin_steps, merge_steps};
use crate::core::types::{StepDefinition, TargetIdentity};

/// Reconciler configuration (TOML).
///
/// Missing fields default to values that work from the directory holding
/// the config file. Relative paths are resolved against that directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Desired-state document (YAML).
    pub spec_path: PathBuf,
    pub target: TargetConfig,
    pub export: ExportConfig,
    /// Step definitions added to, or replacing entries of, the built-in catalog.
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetConfig {
    pub address: Option<String>,
    /// Declared version; overrides the version the client detects.
    pub version: Option<String>,
    /// File backing the local target.
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExportConfig {
    pub dir: PathBuf,
    pub prefix: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            spec_path: PathBuf::from("desired.yaml"),
            target: TargetConfig::default(),
            export: ExportConfig::default(),
            steps: Vec::new(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: None,
            version: None,
            state_file: PathBuf::from("target.json"),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("exports"),
            prefix: "reconcile_export".to_string(),
        }
    }
}

impl ReconcilerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.spec_path.as_os_str().is_empty() {
            return Err(anyhow!("spec_path must not be empty"));
        }
        if self.target.state_file.as_os_str().is_empty() {
            return Err(anyhow!("target.state_file must not be empty"));
        }
        if let Some(address) = &self.target.address
            && (address.trim().is_empty() || address.contains(char::is_whitespace))
        {
            return Err(anyhow!("target.address must be a host or IP address"));
        }
        let prefix = &self.export.prefix;
        if prefix.is_empty() || prefix.contains(['/', '\\']) {
            return Err(anyhow!("export.prefix must be a non-empty file name prefix"));
        }
        for step in &self.steps {
            if step.id.trim().is_empty() || step.category.trim().is_empty() {
                return Err(anyhow!("steps: id and category must be non-empty"));
            }
            if step.key_field.trim().is_empty() {
                return Err(anyhow!("steps.{}: key_field must be non-empty", step.id));
            }
        }
        Ok(())
    }

    /// Built-in catalog merged with configured steps.
    pub fn step_definitions(&self) -> Vec<StepDefinition> {
        merge_steps(builtin_steps(), &self.steps)
    }

    pub fn declared_target(&self) -> TargetIdentity {
        TargetIdentity {
            address: self.target.address.clone(),
            version: self.target.version.clone(),
        }
    }

    /// Resolve relative paths against `base` (the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.spec_path,
            &mut self.target.state_file,
            &mut self.export.dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ReconcilerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ReconcilerConfig> {
    let base = path.parent().unwrap_or(Path::new(""));
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let mut cfg = ReconcilerConfig::default();
        cfg.validate()?;
        cfg.resolve_paths(base);
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: ReconcilerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    cfg.resolve_paths(base);
    debug!(path = %path.display(), steps = cfg.steps.len(), "config loaded");
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ReconcilerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}

/// Point the config at a new target address.
///
/// The file is edited as written (relative paths stay relative). An existing
/// file is first copied to `<config>.bak`, whose path is returned.
pub fn set_target_address(path: &Path, address: &str) -> Result<Option<PathBuf>> {
    let address: IpAddr = address
        .trim()
        .parse()
        .with_context(|| format!("invalid IP address '{address}'"))?;
    let (mut cfg, backup) = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: ReconcilerConfig =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        let mut backup = path.as_os_str().to_os_string();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        fs::copy(path, &backup)
            .with_context(|| format!("back up {} to {}", path.display(), backup.display()))?;
        (cfg, Some(backup))
    } else {
        (ReconcilerConfig::default(), None)
    };
    let previous = cfg.target.address.replace(address.to_string());
    write_config(path, &cfg)?;
    info!(path = %path.display(), ?previous, %address, "target address updated");
    Ok(backup)
}
