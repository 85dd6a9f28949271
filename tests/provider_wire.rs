use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, contains, matches, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{cycle, Expectation, Server};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::json;

use address_geocache::clock::shared_system_clock;
use address_geocache::db::open_in_memory;
use address_geocache::providers::{
    AdapterError, GeoapifyProvider, GeocodeProvider, MapboxProvider, NominatimProvider,
};
use address_geocache::{AddressResolver, AppConfig, Repositories, ResolutionSource};

fn config_for(server: &Server) -> AppConfig {
    let mut config = AppConfig::defaults();
    config.nominatim_base = server.url_str("/search");
    config.nominatim_contact = Some("ops@example.com".into());
    config.nominatim_rps = 10;
    config.geoapify_api_base = server.url_str("/v1/geocode/search");
    config.mapbox_api_base = server.url_str("/geocoding");
    config.provider_timeout_secs = 5;
    config.inter_request_delay_ms = 0;
    config.base_backoff_ms = 0;
    config
}

#[tokio::test]
async fn nominatim_reads_first_place() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", "Fröbelstraße 1, 01159 Dresden")))),
            request::query(url_decoded(contains(("format", "jsonv2")))),
            request::query(url_decoded(contains(("email", "ops@example.com")))),
        ])
        .respond_with(json_encoded(json!([{
            "lat": "51.0489",
            "lon": "13.7079",
            "display_name": "Fröbelstraße 1, Löbtau, Dresden",
            "address": { "postcode": "01159", "city": "Dresden" }
        }]))),
    );

    let provider = NominatimProvider::new(&config_for(&server)).unwrap();
    let hit = provider
        .try_resolve("Fröbelstraße 1, 01159 Dresden", 1)
        .await
        .unwrap();

    assert!((hit.lat - 51.0489).abs() < 1e-9);
    assert!((hit.lon - 13.7079).abs() < 1e-9);
    assert_eq!(hit.postal_code.as_deref(), Some("01159"));
    assert_eq!(hit.locality.as_deref(), Some("Dresden"));
    assert_eq!(hit.source, ResolutionSource::Provider("nominatim".into()));
}

#[tokio::test]
async fn nominatim_empty_list_is_no_result() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/search")).respond_with(json_encoded(json!([]))),
    );

    let provider = NominatimProvider::new(&config_for(&server)).unwrap();
    let outcome = provider.try_resolve("Nicht Existente Straße 999", 1).await;
    assert_eq!(outcome, Err(AdapterError::NoResult));
}

#[tokio::test]
async fn nominatim_status_codes_become_outcome_kinds() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "limited")))))
            .respond_with(status_code(429).insert_header("Retry-After", "5")),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "down")))))
            .respond_with(status_code(503)),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "forbidden")))))
            .respond_with(status_code(403)),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains(("q", "garbled")))))
            .respond_with(status_code(200).body("<html>maintenance</html>")),
    );

    let provider = NominatimProvider::new(&config_for(&server)).unwrap();
    assert_eq!(
        provider.try_resolve("limited", 1).await,
        Err(AdapterError::RateLimited {
            retry_after: Some(Duration::from_secs(5))
        })
    );
    assert!(matches!(
        provider.try_resolve("down", 1).await,
        Err(AdapterError::Transient(_))
    ));
    assert!(matches!(
        provider.try_resolve("forbidden", 1).await,
        Err(AdapterError::Hard(_))
    ));
    assert!(matches!(
        provider.try_resolve("garbled", 1).await,
        Err(AdapterError::Hard(_))
    ));
}

#[tokio::test]
async fn geoapify_reads_geojson_feature() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/v1/geocode/search"),
            request::query(url_decoded(contains(("apiKey", "geo-key")))),
            request::query(url_decoded(contains(("filter", "countrycode:de")))),
        ])
        .respond_with(json_encoded(json!({
            "type": "FeatureCollection",
            "features": [{
                "geometry": { "type": "Point", "coordinates": [13.7373, 51.0504] },
                "properties": {
                    "formatted": "Wiener Platz 4, 01069 Dresden",
                    "postcode": "01069",
                    "city": "Dresden"
                }
            }]
        }))),
    );

    let mut config = config_for(&server);
    config.geoapify_api_key = Some(SecretString::from("geo-key".to_string()));
    let provider = GeoapifyProvider::maybe_new(&config).unwrap().unwrap();
    let hit = provider.try_resolve("Wiener Platz 4, 01069 Dresden", 1).await.unwrap();

    assert!((hit.lat - 51.0504).abs() < 1e-9);
    assert!((hit.lon - 13.7373).abs() < 1e-9);
    assert_eq!(hit.postal_code.as_deref(), Some("01069"));
    assert_eq!(hit.source, ResolutionSource::Provider("geoapify".into()));
}

#[tokio::test]
async fn mapbox_reads_center_and_context() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path(matches(r"^/geocoding/.+\.json$")),
            request::query(url_decoded(contains(("access_token", "pk.test")))),
        ])
        .respond_with(json_encoded(json!({
            "features": [{
                "center": [13.7373, 51.0504],
                "place_name": "Wiener Platz 4, 01069 Dresden, Germany",
                "context": [
                    { "id": "postcode.123", "text": "01069" },
                    { "id": "place.456", "text": "Dresden" }
                ]
            }]
        }))),
    );

    let mut config = config_for(&server);
    config.mapbox_token = Some(SecretString::from("pk.test".to_string()));
    let provider = MapboxProvider::maybe_new(&config).unwrap().unwrap();
    let hit = provider.try_resolve("Wiener Platz 4, 01069 Dresden", 1).await.unwrap();

    assert!((hit.lat - 51.0504).abs() < 1e-9);
    assert_eq!(hit.postal_code.as_deref(), Some("01069"));
    assert_eq!(hit.locality.as_deref(), Some("Dresden"));
}

#[tokio::test]
async fn configured_resolver_retries_after_rate_limit() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", "Fröbelstraße 1, 01159 Dresden")))),
        ])
        .times(2)
        .respond_with(cycle![
            status_code(429).insert_header("Retry-After", "1"),
            json_encoded(json!([{ "lat": "51.0489", "lon": "13.7079" }])),
        ]),
    );

    let config = config_for(&server);
    let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
    let repos = Repositories::sqlite(db, shared_system_clock());
    let resolver = AddressResolver::from_config(&config, repos).unwrap();
    assert_eq!(resolver.provider_names(), vec!["nominatim", "heuristic"]);

    let resolved = resolver
        .resolve("Fröbelstraße 1, 01159 Dresden", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.source, ResolutionSource::Provider("nominatim".into()));
    let cached = resolver
        .repositories()
        .cache
        .get("Fröbelstraße 1, 01159 Dresden")
        .unwrap();
    assert!(cached.is_some());
}

#[tokio::test]
async fn configured_resolver_retries_a_corrected_spelling() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::query(url_decoded(contains((
            "q",
            "Hauptstrasse 3, 01067 Dresden",
        )))))
        .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(request::query(url_decoded(contains((
            "q",
            "Hauptstraße 3, 01067 Dresden",
        )))))
        .respond_with(json_encoded(json!([{ "lat": "51.0520", "lon": "13.7410" }]))),
    );

    let config = config_for(&server);
    let db = Arc::new(Mutex::new(open_in_memory().unwrap()));
    let repos = Repositories::sqlite(db, shared_system_clock());
    let resolver = AddressResolver::from_config(&config, repos).unwrap();

    let resolved = resolver
        .resolve("Hauptstrasse 3, 01067 Dresden", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.source, ResolutionSource::Heuristic);
    assert_eq!(resolved.address, "Hauptstrasse 3, 01067 Dresden");
}
