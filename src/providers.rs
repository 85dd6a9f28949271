use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::cache::ResolutionSource;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::ratelimit::RateLimiter;

const USER_AGENT: &str = concat!("address-geocache/", env!("CARGO_PKG_VERSION"));
const GEOAPIFY_RPS: u32 = 5;
const MAPBOX_RPS: u32 = 10;

/// Outcome kinds an adapter call can end in. The cascade's retry decision
/// depends on nothing but this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    RateLimited { retry_after: Option<Duration> },
    Transient(String),
    NoResult,
    Hard(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::RateLimited { .. } | AdapterError::Transient(_)
        )
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterError::RateLimited {
                retry_after: Some(wait),
            } => write!(f, "rate limited, retry after {}s", wait.as_secs_f64()),
            AdapterError::RateLimited { retry_after: None } => f.write_str("rate limited"),
            AdapterError::Transient(detail) => write!(f, "transient failure: {detail}"),
            AdapterError::NoResult => f.write_str("no result"),
            AdapterError::Hard(detail) => write!(f, "hard failure: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderHit {
    pub lat: f64,
    pub lon: f64,
    pub source: ResolutionSource,
    pub postal_code: Option<String>,
    pub locality: Option<String>,
    pub display_name: Option<String>,
}

impl ProviderHit {
    pub fn new(lat: f64, lon: f64, source: ResolutionSource) -> Self {
        Self {
            lat,
            lon,
            source,
            postal_code: None,
            locality: None,
            display_name: None,
        }
    }
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn try_resolve(&self, query: &str, limit: usize) -> Result<ProviderHit, AdapterError>;
}

/// Network adapters in cascade order. Adapters without credentials are left out.
pub fn http_providers(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let mut providers: Vec<Arc<dyn GeocodeProvider>> = Vec::new();
    if let Some(mapbox) = MapboxProvider::maybe_new(config)? {
        providers.push(Arc::new(mapbox));
    }
    if let Some(geoapify) = GeoapifyProvider::maybe_new(config)? {
        providers.push(Arc::new(geoapify));
    }
    providers.push(Arc::new(NominatimProvider::new(config)?));
    debug!(
        target: "providers",
        adapters = ?providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
        "provider chain assembled"
    );
    Ok(providers)
}

struct HttpBackend {
    http: Client,
    limiter: RateLimiter,
}

impl HttpBackend {
    fn new(config: &AppConfig, rps: u32) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.provider_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            limiter: RateLimiter::per_second(rps),
        })
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, AdapterError> {
        self.limiter.wait().await;
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| parse_retry_after(value, Utc::now()));
            return Err(classify_status(status, retry_after));
        }
        response.json::<T>().await.map_err(classify_transport)
    }
}

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> AdapterError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        AdapterError::RateLimited { retry_after }
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        AdapterError::Transient(format!("http {status}"))
    } else {
        AdapterError::Hard(format!("http {status}"))
    }
}

fn classify_transport(err: reqwest::Error) -> AdapterError {
    if err.is_decode() {
        AdapterError::Hard(format!("unreadable response: {err}"))
    } else {
        AdapterError::Transient(err.to_string())
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn usable_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && !(lat == 0.0 && lon == 0.0)
}

fn parse_base(base: &str, label: &str) -> AppResult<Url> {
    Url::parse(base).map_err(|err| AppError::Config(format!("invalid {label} base URL: {err}")))
}

pub struct MapboxProvider {
    backend: HttpBackend,
    token: SecretString,
    base: Url,
}

impl MapboxProvider {
    pub fn maybe_new(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(token) = config.mapbox_token.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            backend: HttpBackend::new(config, MAPBOX_RPS)?,
            token,
            base: parse_base(&config.mapbox_api_base, "Mapbox")?,
        }))
    }
}

#[async_trait]
impl GeocodeProvider for MapboxProvider {
    fn name(&self) -> &str {
        "mapbox"
    }

    async fn try_resolve(&self, query: &str, limit: usize) -> Result<ProviderHit, AdapterError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            features: Vec<Feature>,
        }

        #[derive(Deserialize)]
        struct Feature {
            center: Option<[f64; 2]>,
            place_name: Option<String>,
            #[serde(default)]
            context: Vec<ContextItem>,
        }

        #[derive(Deserialize)]
        struct ContextItem {
            id: String,
            text: Option<String>,
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::Hard("Mapbox base URL cannot take a path".into()))?
            .pop_if_empty()
            .push(&format!("{query}.json"));

        let limit = limit.max(1).to_string();
        let request = self.backend.http.get(url).query(&[
            ("access_token", self.token.expose_secret()),
            ("limit", limit.as_str()),
            ("language", "de"),
            ("country", "de"),
        ]);
        let parsed: Response = self.backend.fetch_json(request).await?;
        let feature = parsed.features.into_iter().next().ok_or(AdapterError::NoResult)?;
        let [lon, lat] = feature.center.ok_or(AdapterError::NoResult)?;
        if !usable_coordinate(lat, lon) {
            return Err(AdapterError::NoResult);
        }

        let context_text = |prefix: &str| {
            feature
                .context
                .iter()
                .find(|item| item.id.starts_with(prefix))
                .and_then(|item| item.text.clone())
        };
        let hit = ProviderHit {
            postal_code: context_text("postcode."),
            locality: context_text("place."),
            display_name: feature.place_name.clone(),
            ..ProviderHit::new(lat, lon, ResolutionSource::Provider(self.name().to_string()))
        };
        trace!(target: "providers", provider = "mapbox", lat, lon, "hit");
        Ok(hit)
    }
}

pub struct GeoapifyProvider {
    backend: HttpBackend,
    api_key: SecretString,
    base: Url,
}

impl GeoapifyProvider {
    pub fn maybe_new(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(api_key) = config.geoapify_api_key.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            backend: HttpBackend::new(config, GEOAPIFY_RPS)?,
            api_key,
            base: parse_base(&config.geoapify_api_base, "Geoapify")?,
        }))
    }
}

#[async_trait]
impl GeocodeProvider for GeoapifyProvider {
    fn name(&self) -> &str {
        "geoapify"
    }

    async fn try_resolve(&self, query: &str, limit: usize) -> Result<ProviderHit, AdapterError> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            features: Vec<Feature>,
        }

        #[derive(Deserialize)]
        struct Feature {
            geometry: Option<Geometry>,
            #[serde(default)]
            properties: Properties,
        }

        #[derive(Deserialize)]
        struct Geometry {
            coordinates: Option<[f64; 2]>,
        }

        #[derive(Deserialize, Default)]
        struct Properties {
            formatted: Option<String>,
            postcode: Option<String>,
            city: Option<String>,
        }

        let limit = limit.max(1).to_string();
        let request = self.backend.http.get(self.base.clone()).query(&[
            ("text", query),
            ("apiKey", self.api_key.expose_secret()),
            ("limit", limit.as_str()),
            ("lang", "de"),
            ("filter", "countrycode:de"),
        ]);
        let parsed: Response = self.backend.fetch_json(request).await?;
        let feature = parsed.features.into_iter().next().ok_or(AdapterError::NoResult)?;
        let [lon, lat] = feature
            .geometry
            .and_then(|geometry| geometry.coordinates)
            .ok_or(AdapterError::NoResult)?;
        if !usable_coordinate(lat, lon) {
            return Err(AdapterError::NoResult);
        }

        Ok(ProviderHit {
            postal_code: feature.properties.postcode,
            locality: feature.properties.city,
            display_name: feature.properties.formatted,
            ..ProviderHit::new(lat, lon, ResolutionSource::Provider(self.name().to_string()))
        })
    }
}

pub struct NominatimProvider {
    backend: HttpBackend,
    contact: Option<String>,
    base: Url,
}

impl NominatimProvider {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            backend: HttpBackend::new(config, config.nominatim_rps)?,
            contact: config.nominatim_contact.clone(),
            base: parse_base(&config.nominatim_base, "Nominatim")?,
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn name(&self) -> &str {
        "nominatim"
    }

    async fn try_resolve(&self, query: &str, limit: usize) -> Result<ProviderHit, AdapterError> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
            display_name: Option<String>,
            #[serde(default)]
            address: Address,
        }

        #[derive(Deserialize, Default)]
        struct Address {
            postcode: Option<String>,
            city: Option<String>,
            town: Option<String>,
            village: Option<String>,
        }

        let mut params = vec![
            ("q", query.to_string()),
            ("format", "jsonv2".to_string()),
            ("addressdetails", "1".to_string()),
            ("limit", limit.max(1).to_string()),
        ];
        if let Some(contact) = &self.contact {
            params.push(("email", contact.clone()));
        }

        let request = self.backend.http.get(self.base.clone()).query(&params);
        let places: Vec<Place> = self.backend.fetch_json(request).await?;
        let place = places.into_iter().next().ok_or(AdapterError::NoResult)?;
        let lat = place
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|_| AdapterError::Hard(format!("malformed latitude {:?}", place.lat)))?;
        let lon = place
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|_| AdapterError::Hard(format!("malformed longitude {:?}", place.lon)))?;
        if !usable_coordinate(lat, lon) {
            return Err(AdapterError::NoResult);
        }

        let address = place.address;
        Ok(ProviderHit {
            postal_code: address.postcode,
            locality: address.city.or(address.town).or(address.village),
            display_name: place.display_name,
            ..ProviderHit::new(lat, lon, ResolutionSource::Provider(self.name().to_string()))
        })
    }
}
