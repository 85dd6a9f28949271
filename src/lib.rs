pub mod alias;
pub mod cache;
pub mod cascade;
pub mod clock;
pub mod config;
pub mod corrections;
pub mod db;
pub mod errors;
pub mod failcache;
pub mod health;
pub mod manual;
pub mod normalize;
pub mod providers;
pub mod ratelimit;
pub mod resolver;
pub mod settings;
pub mod synonyms;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::clock::shared_system_clock;
use crate::db::{bootstrap, DatabaseBootstrap, DatabaseContext};
use crate::settings::{settings_path, UpdateResolverSettingsPayload};

pub use crate::cache::{CacheEntry, ResolutionSource};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult, EncodingError};
pub use crate::health::GeocacheHealth;
pub use crate::normalize::{canonical_key, normalize, NormalizedAddress};
pub use crate::resolver::{
    AddressResolver, BatchOptions, BatchReport, BatchStatus, MatchRow, MatchStatus, Repositories,
    Resolution,
};
pub use crate::settings::ResolverSettings;
pub use crate::telemetry::{GeocacheEvent, TelemetryClient};

/// Everything a host process needs: the opened store, the resolver wired to
/// it and the persisted operator settings.
pub struct GeocacheService {
    db_path: PathBuf,
    settings_path: PathBuf,
    config: AppConfig,
    telemetry: TelemetryClient,
    settings: Mutex<ResolverSettings>,
    resolver: AddressResolver,
    db_bootstrap_recovered: bool,
}

impl GeocacheService {
    pub fn initialize<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = bootstrap(data_dir, &config.database_file_name)?;
        let db = Arc::new(Mutex::new(connection));
        let telemetry = TelemetryClient::new(data_dir, &config)?;
        let settings_path = settings_path(data_dir);
        let settings = ResolverSettings::load(&settings_path, &config)?;

        let repos = Repositories::sqlite(db, shared_system_clock());
        let resolver =
            AddressResolver::from_config(&config, repos)?.with_telemetry(telemetry.clone());
        resolver.apply_settings(&settings);

        let expired = resolver.repositories().fails.cleanup_expired()?;
        info!(
            target: "geocache",
            providers = ?resolver.provider_names(),
            expired_failures = expired,
            recovered,
            "address resolver ready"
        );

        if let Err(err) = telemetry.record(GeocacheEvent::ResolverStart {
            version: env!("CARGO_PKG_VERSION").to_string(),
            providers: resolver.provider_names(),
            recovered,
        }) {
            warn!(?err, "failed to queue telemetry bootstrap event");
        }
        if let Err(err) = telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }

        Ok(Self {
            db_path: path,
            settings_path,
            config,
            telemetry,
            settings: Mutex::new(settings),
            resolver,
            db_bootstrap_recovered: recovered,
        })
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn settings(&self) -> ResolverSettings {
        self.settings.lock().clone()
    }

    pub fn update_settings(
        &self,
        payload: &UpdateResolverSettingsPayload,
    ) -> AppResult<ResolverSettings> {
        let mut settings = self.settings.lock();
        settings.apply_patch(payload);
        settings.persist(&self.settings_path)?;
        self.resolver.apply_settings(&settings);
        Ok(settings.clone())
    }

    pub fn health(&self) -> AppResult<GeocacheHealth> {
        let repos = self.resolver.repositories();
        Ok(GeocacheHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            db_bootstrap_recovered: self.db_bootstrap_recovered,
            telemetry_buffer_path: self.telemetry.buffer_path().to_string_lossy().to_string(),
            telemetry_queue_depth: self.telemetry.queue_depth(),
            cached_addresses: repos.cache.count()?,
            fail_cache: repos.fails.stats()?,
            fail_reasons: repos.fails.reasons_histogram()?,
            manual_queue: repos.manual.stats()?,
            providers: self.resolver.provider_names(),
            settings: self.settings(),
            config: self.config.public_profile(),
        })
    }

}

impl Drop for GeocacheService {
    fn drop(&mut self) {
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry on shutdown");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_geocache=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
