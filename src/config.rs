use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cascade::BoundingBox;

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
pub const DEFAULT_NOMINATIM_BASE: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_MAPBOX_BASE: &str = "https://api.mapbox.com/geocoding/v5/mapbox.places";
pub const DEFAULT_GEOAPIFY_BASE: &str = "https://api.geoapify.com/v1/geocode/search";

/// Saxony, Brandenburg, Saxony-Anhalt and Thuringia combined.
pub const DEFAULT_SERVICE_AREA: BoundingBox = BoundingBox {
    min_lat: 50.171,
    min_lon: 9.877,
    max_lat: 53.558,
    max_lon: 15.038,
};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub enforce_resolution: bool,
    pub batch_limit: usize,
    pub escalate_no_result: bool,
    pub inter_request_delay_ms: u64,
    pub transient_ttl_minutes: u32,
    pub no_result_ttl_minutes: u32,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub provider_timeout_secs: u64,
    pub max_retry_after_secs: u64,
    pub service_area: BoundingBox,
    pub mapbox_token: Option<SecretString>,
    pub mapbox_api_base: String,
    pub geoapify_api_key: Option<SecretString>,
    pub geoapify_api_base: String,
    pub nominatim_base: String,
    pub nominatim_contact: Option<String>,
    pub nominatim_rps: u32,
    pub database_file_name: String,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub enforce_resolution: bool,
    pub batch_limit: usize,
    pub escalate_no_result: bool,
    pub inter_request_delay_ms: u64,
    pub transient_ttl_minutes: u32,
    pub no_result_ttl_minutes: u32,
    pub max_attempts: u32,
    pub provider_timeout_secs: u64,
    pub service_area: BoundingBox,
    pub nominatim_base: String,
    pub database_file_name: String,
    pub telemetry_enabled_by_default: bool,
    pub has_mapbox_token: bool,
    pub has_geoapify_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            enforce_resolution: parse_bool("GEOCODE_ENFORCE", true),
            batch_limit: parse_usize("GEOCODE_BATCH_LIMIT", 25),
            escalate_no_result: parse_bool("GEOCODE_NO_RESULT_TO_MANUAL", true),
            inter_request_delay_ms: parse_u64("GEOCODE_INTER_REQUEST_DELAY_MS", 1_000),
            transient_ttl_minutes: parse_u32("GEOCODE_TRANSIENT_TTL_MIN", 60).max(1),
            no_result_ttl_minutes: parse_u32("GEOCODE_NO_RESULT_TTL_MIN", 60).max(1),
            max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", 3).max(1),
            base_backoff_ms: parse_u64("GEOCODE_BASE_BACKOFF_MS", 1_000),
            provider_timeout_secs: parse_u64("GEOCODE_TIMEOUT_S", 20).max(1),
            max_retry_after_secs: parse_u64("GEOCODE_MAX_RETRY_AFTER_S", 60),
            service_area: parse_bbox("GEOCODE_BBOX").unwrap_or(DEFAULT_SERVICE_AREA),
            mapbox_token: parse_secret("MAPBOX_ACCESS_TOKEN"),
            mapbox_api_base: env::var("MAPBOX_API_BASE")
                .unwrap_or_else(|_| DEFAULT_MAPBOX_BASE.to_string()),
            geoapify_api_key: parse_secret("GEOAPIFY_API_KEY"),
            geoapify_api_base: env::var("GEOAPIFY_API_BASE")
                .unwrap_or_else(|_| DEFAULT_GEOAPIFY_BASE.to_string()),
            nominatim_base: env::var("GEOCODER_BASE")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_BASE.to_string()),
            nominatim_contact: env::var("GEOCODER_CONTACT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            nominatim_rps: parse_u32("GEOCODER_RPS", 1).max(1),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "geocache.db".to_string()),
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }

    /// Offline defaults with no provider credentials. Used by tests and
    /// embedders that configure everything in code.
    pub fn defaults() -> Self {
        Self {
            enforce_resolution: true,
            batch_limit: 25,
            escalate_no_result: true,
            inter_request_delay_ms: 1_000,
            transient_ttl_minutes: 60,
            no_result_ttl_minutes: 60,
            max_attempts: 3,
            base_backoff_ms: 1_000,
            provider_timeout_secs: 20,
            max_retry_after_secs: 60,
            service_area: DEFAULT_SERVICE_AREA,
            mapbox_token: None,
            mapbox_api_base: DEFAULT_MAPBOX_BASE.to_string(),
            geoapify_api_key: None,
            geoapify_api_base: DEFAULT_GEOAPIFY_BASE.to_string(),
            nominatim_base: DEFAULT_NOMINATIM_BASE.to_string(),
            nominatim_contact: None,
            nominatim_rps: 1,
            database_file_name: "geocache.db".to_string(),
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            enforce_resolution: self.enforce_resolution,
            batch_limit: self.batch_limit,
            escalate_no_result: self.escalate_no_result,
            inter_request_delay_ms: self.inter_request_delay_ms,
            transient_ttl_minutes: self.transient_ttl_minutes,
            no_result_ttl_minutes: self.no_result_ttl_minutes,
            max_attempts: self.max_attempts,
            provider_timeout_secs: self.provider_timeout_secs,
            service_area: self.service_area,
            nominatim_base: self.nominatim_base.clone(),
            database_file_name: self.database_file_name.clone(),
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            has_mapbox_token: self.mapbox_token.is_some(),
            has_geoapify_key: self.geoapify_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| match v.trim() {
            "1" | "true" | "TRUE" | "True" => true,
            "0" | "false" | "FALSE" | "False" => false,
            _ => default,
        })
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_bbox(key: &str) -> Option<BoundingBox> {
    let raw = env::var(key).ok()?;
    match BoundingBox::parse(&raw) {
        Some(bbox) => Some(bbox),
        None => {
            warn!(value = %raw, "ignoring malformed {key}; expected min_lat,min_lon,max_lat,max_lon");
            None
        }
    }
}
