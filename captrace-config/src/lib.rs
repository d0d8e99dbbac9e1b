//! Pipeline configuration.
//!
//! Every recognized option lives on an explicit struct below; unknown keys
//! fail the load instead of being ignored, so a typo in an operator's TOML
//! surfaces at startup rather than as silently-default behaviour.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

mod models;

pub use models::{
    LlmSettings, RootConfig, Settings, StageDeadlines, Tolerances,
    WorkerSettings,
};

/// Environment variable naming a TOML settings file.
pub const SETTINGS_PATH_VAR: &str = "CAPTRACE_CONFIG_PATH";
/// Environment variable carrying inline JSON settings.
pub const SETTINGS_JSON_VAR: &str = "CAPTRACE_CONFIG_JSON";

/// Source that produced the loaded settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl Settings {
    /// Load settings using environment variables. Evaluation order:
    /// 1) `$CAPTRACE_CONFIG_PATH` (TOML file),
    /// 2) `$CAPTRACE_CONFIG_JSON` (inline JSON),
    /// 3) defaults if neither is set.
    pub fn load_from_env() -> anyhow::Result<(Self, SettingsSource)> {
        if let Ok(path_str) = env::var(SETTINGS_PATH_VAR) {
            if !path_str.trim().is_empty() {
                let path = PathBuf::from(path_str);
                let settings = Self::load_from_file(&path)?;
                return Ok((settings, SettingsSource::EnvPath(path)));
            }
        }

        if let Ok(inline) = env::var(SETTINGS_JSON_VAR) {
            if !inline.trim().is_empty() {
                let settings: Settings = serde_json::from_str(&inline)
                    .context("parsing inline JSON settings")?;
                settings.validate()?;
                return Ok((settings, SettingsSource::EnvInline));
            }
        }

        Ok((Settings::default(), SettingsSource::Default))
    }

    /// Load and validate a TOML settings file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Sanity checks that cannot be expressed in the type system.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.roots.is_empty() {
            return Err(anyhow!("at least one investor root must be configured"));
        }
        for root in &self.roots {
            if root.investor_code.trim().is_empty() {
                return Err(anyhow!(
                    "root {} is missing an investor_code",
                    root.path.display()
                ));
            }
        }
        if self.supported_extensions.is_empty() {
            return Err(anyhow!("supported_extensions must not be empty"));
        }
        for ext in &self.supported_extensions {
            if !ext.starts_with('.') {
                return Err(anyhow!(
                    "extension {ext:?} must include the leading dot"
                ));
            }
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if self.work_queue_capacity == 0 {
            return Err(anyhow!("work_queue_capacity must be at least 1"));
        }
        if self.reporting_currency.len() != 3 {
            return Err(anyhow!(
                "reporting_currency must be an ISO-4217 code, got {:?}",
                self.reporting_currency
            ));
        }
        self.tolerances.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_toml() -> &'static str {
        r#"
            reporting_currency = "EUR"

            [[roots]]
            path = "/data/brainweb"
            investor_code = "brainweb"

            [[roots]]
            path = "/data/pecunalta"
            investor_code = "pecunalta"
        "#
    }

    #[test]
    fn parses_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(valid_toml().as_bytes()).unwrap();
        let settings = Settings::load_from_file(file.path()).unwrap();
        assert_eq!(settings.roots.len(), 2);
        assert_eq!(settings.roots[0].investor_code, "brainweb");
        assert_eq!(settings.debounce_seconds, 5);
        assert_eq!(settings.max_file_size_mb, 100);
    }

    #[test]
    fn unknown_keys_are_an_error() {
        let toml = format!("{}\nnot_a_real_option = true\n", valid_toml());
        let err = toml::from_str::<Settings>(&toml).unwrap_err();
        assert!(err.to_string().contains("not_a_real_option"));
    }

    #[test]
    fn rejects_extension_without_dot() {
        let mut settings = Settings::default();
        settings.roots.push(RootConfig {
            path: PathBuf::from("/data/x"),
            investor_code: "x".into(),
        });
        settings.supported_extensions = vec!["pdf".into()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_empty_roots() {
        let settings = Settings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn default_tolerances_are_spec_values() {
        let t = Tolerances::default();
        assert_eq!(t.nav_pct, 0.001);
        assert_eq!(t.nav_abs, 100.0);
        assert_eq!(t.commitment_pct, 0.001);
        assert_eq!(t.irr_pp, 0.001);
        assert_eq!(t.multiple_abs, 0.01);
        assert_eq!(t.tvpi_identity, 0.001);
    }
}
