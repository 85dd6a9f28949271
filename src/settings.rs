use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const MAX_TTL_MINUTES: u32 = 7 * 24 * 60;
const MAX_DELAY_MS: u64 = 60_000;

/// Operator-tunable knobs persisted next to the database. Values here win
/// over the environment once the file exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverSettings {
    pub inter_request_delay_ms: u64,
    pub transient_ttl_minutes: u32,
    pub no_result_ttl_minutes: u32,
    pub escalate_no_result: bool,
    pub telemetry_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResolverSettingsPayload {
    pub inter_request_delay_ms: Option<u64>,
    pub transient_ttl_minutes: Option<u32>,
    pub no_result_ttl_minutes: Option<u32>,
    pub escalate_no_result: Option<bool>,
    pub telemetry_enabled: Option<bool>,
}

impl ResolverSettings {
    pub fn load(path: &Path, config: &AppConfig) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(settings) => Ok(settings.clamped()),
                Err(err) => {
                    warn!(
                        target: "settings",
                        error = ?err,
                        "failed to parse settings file; regenerating defaults"
                    );
                    let defaults = Self::from_config(config);
                    defaults.persist(path)?;
                    Ok(defaults)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let defaults = Self::from_config(config);
                defaults.persist(path)?;
                Ok(defaults)
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn apply_patch(&mut self, payload: &UpdateResolverSettingsPayload) {
        if let Some(delay) = payload.inter_request_delay_ms {
            self.inter_request_delay_ms = clamp_delay(delay);
        }
        if let Some(ttl) = payload.transient_ttl_minutes {
            self.transient_ttl_minutes = clamp_ttl(ttl);
        }
        if let Some(ttl) = payload.no_result_ttl_minutes {
            self.no_result_ttl_minutes = clamp_ttl(ttl);
        }
        if let Some(escalate) = payload.escalate_no_result {
            self.escalate_no_result = escalate;
        }
        if let Some(enabled) = payload.telemetry_enabled {
            self.telemetry_enabled = enabled;
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            inter_request_delay_ms: config.inter_request_delay_ms,
            transient_ttl_minutes: config.transient_ttl_minutes,
            no_result_ttl_minutes: config.no_result_ttl_minutes,
            escalate_no_result: config.escalate_no_result,
            telemetry_enabled: config.telemetry_enabled_by_default,
        }
        .clamped()
    }

    fn clamped(mut self) -> Self {
        self.inter_request_delay_ms = clamp_delay(self.inter_request_delay_ms);
        self.transient_ttl_minutes = clamp_ttl(self.transient_ttl_minutes);
        self.no_result_ttl_minutes = clamp_ttl(self.no_result_ttl_minutes);
        self
    }
}

fn clamp_ttl(minutes: u32) -> u32 {
    minutes.clamp(1, MAX_TTL_MINUTES)
}

fn clamp_delay(ms: u64) -> u64 {
    ms.min(MAX_DELAY_MS)
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}
