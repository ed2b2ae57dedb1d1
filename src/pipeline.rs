use crate::config::AppConfig;
use crate::data::load_mineral_localities;
use crate::export::{write_exports_and_map, ExportPaths};
use crate::fetch::{self, HttpClient};
use crate::package::pack_output;
use crate::processing::merge_localities;
use crate::types::{BoundaryPolygon, LocalityRecord, SourceKind};
use anyhow::{Context, Result};
use geo::Point;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub use_sample: bool,
    pub pack_output: bool,
}

/// Runs the `build` command: gather places and boundaries, merge, append the
/// curated mineral sites and write every export.
///
/// Fails only when the place source cannot be fetched (outside sample mode)
/// or an export cannot be written.
pub async fn run_build(config: &AppConfig, options: BuildOptions) -> Result<Option<ExportPaths>> {
    let output_dir = &config.output.output_dir;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    let (places, boundaries) = if options.use_sample {
        info!("Using sample data for quick local testing...");
        (sample_places(), Vec::new())
    } else {
        let client = HttpClient::new(&config.fetch)?;
        let places = fetch_places(&client, config).await?;
        info!("Fetched {} OSM place elements", places.len());
        let boundaries = fetch_boundaries(&client, config).await;
        (places, boundaries)
    };

    let mut table = merge_localities(&places, &boundaries)?;

    if let Some(table) = table.as_mut() {
        if let Some(minerals) = load_mineral_localities(&config.input.mineral_csv) {
            info!("Merging {} mineral localities into dataset", minerals.len());
            let added = table.extend_unique(minerals);
            info!("Total localities after merge: {} ({} mineral sites added)", table.len(), added);
        }
    }

    let paths = write_exports_and_map(table.as_ref(), output_dir, &config.output.site_dir)?;

    if options.pack_output {
        if let Err(e) = pack_output(output_dir, config.region.year) {
            error!("Failed to package output: {:#}", e);
        }
    }

    Ok(paths)
}

pub fn sample_places() -> Vec<LocalityRecord> {
    vec![LocalityRecord {
        source_id: 1,
        source_kind: SourceKind::Node,
        raw_name: Some("Sample Place".to_string()),
        final_name: None,
        place: Some("city".to_string()),
        population: Some("1000".to_string()),
        geoid: None,
        point: Point::new(-79.0, 35.5),
    }]
}

async fn fetch_places(client: &HttpClient, config: &AppConfig) -> Result<Vec<LocalityRecord>> {
    let state = fetch::fetch_state_polygon(client, &config.fetch.nominatim_url, &config.region.state)
        .await
        .context("Failed to fetch OSM data")?;

    let bbox = match state.bbox() {
        Some(bbox) => bbox,
        None => {
            warn!("State lookup returned no outline; using the configured bounding box");
            config.region.fallback_bbox()
        }
    };

    fetch::fetch_osm_places(client, &config.fetch.overpass_url, &bbox)
        .await
        .context("Failed to fetch OSM data")
}

/// Tries the configured TIGER year, then each earlier vintage down to
/// `min_year`. Running out of years is not fatal.
async fn fetch_boundaries(client: &HttpClient, config: &AppConfig) -> Vec<BoundaryPolygon> {
    let region = &config.region;
    for year in (region.min_year..=region.year).rev() {
        match fetch::fetch_census_places(client, &config.fetch.census_base, &region.state_fips, year).await {
            Ok(boundaries) => {
                info!("Loaded {} census place boundaries for {}", boundaries.len(), year);
                return boundaries;
            }
            Err(e) => warn!("Census {} unavailable: {:#}", year, e),
        }
    }
    warn!("No census boundaries could be fetched; continuing with OSM places only");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{CSV_FILE, GEOJSON_FILE};
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.output.output_dir = root.join("output");
        config.output.site_dir = root.join("site");
        config.input.mineral_csv = root.join("mineral_localities.csv");
        config.fetch.max_retries = 0;
        config.fetch.backoff_ms = 1;
        config
    }

    fn read_features(path: &Path) -> Vec<Value> {
        let json: Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        json["features"].as_array().unwrap().clone()
    }

    #[tokio::test]
    async fn sample_mode_runs_full_export() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let paths = run_build(&config, BuildOptions { use_sample: true, pack_output: false })
            .await
            .unwrap()
            .unwrap();

        let features = read_features(&paths.geojson);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["final_name"], "Sample Place");
        assert!(features[0]["properties"]["geoid"].is_null());
        assert_eq!(features[0]["geometry"]["coordinates"], json!([-79.0, 35.5]));
    }

    #[tokio::test]
    async fn minerals_are_appended_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::write(
            &config.input.mineral_csv,
            "name,mineral_type,description,latitude,longitude\n\
             Reed Gold Mine,gold,Gold. Cabarrus County.,35.2868,-80.4665\n\
             Reed Gold Mine,gold,Gold. Cabarrus County.,35.2868,-80.4665\n\
             Sample Place,other,Same key as the sample point,35.5,-79.0\n",
        )
        .unwrap();
        fs::create_dir_all(&config.output.site_dir).unwrap();

        let paths = run_build(&config, BuildOptions { use_sample: true, pack_output: true })
            .await
            .unwrap()
            .unwrap();

        let features = read_features(&paths.geojson);
        assert_eq!(features.len(), 2);
        assert_eq!(features[1]["properties"]["osm_type"], "mineral_site");
        assert_eq!(features[1]["properties"]["place"], "gold");

        assert!(config.output.site_dir.join("data").join(CSV_FILE).exists());
        assert!(dir.path().join("nc_localities_output_2025.zip").exists());
    }

    #[tokio::test]
    async fn census_failure_falls_back_to_osm_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"osm_type": "node", "display_name": "North Carolina"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interpreter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "elements": [
                    {"type": "node", "id": 42, "lat": 35.78, "lon": -78.64,
                     "tags": {"name": "Raleigh", "place": "city", "population": "467665"}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tiger/TIGER2021/PLACE/tl_2021_37_place.zip"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tiger/TIGER2020/PLACE/tl_2020_37_place.zip"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.fetch.nominatim_url = format!("{}/search", server.uri());
        config.fetch.overpass_url = format!("{}/interpreter", server.uri());
        config.fetch.census_base = format!("{}/tiger/", server.uri());
        config.region.year = 2021;

        let paths = run_build(&config, BuildOptions::default()).await.unwrap().unwrap();
        let features = read_features(&paths.geojson);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["final_name"], "Raleigh");
        assert_eq!(features[0]["properties"]["osm_id"], 42);
        assert!(features[0]["properties"]["geoid"].is_null());
    }

    #[tokio::test]
    async fn census_falls_back_to_earlier_year() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"osm_type": "node", "display_name": "North Carolina"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interpreter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "elements": [
                    {"type": "node", "id": 42, "lat": 35.5, "lon": -79.0,
                     "tags": {"place": "town", "population": "900"}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tiger/TIGER2021/PLACE/tl_2021_37_place.zip"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tiger/TIGER2020/PLACE/tl_2020_37_place.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(crate::fetch::tests::tiger_zip()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.fetch.nominatim_url = format!("{}/search", server.uri());
        config.fetch.overpass_url = format!("{}/interpreter", server.uri());
        config.fetch.census_base = format!("{}/tiger/", server.uri());
        config.region.year = 2021;

        let paths = run_build(&config, BuildOptions::default()).await.unwrap().unwrap();
        let features = read_features(&paths.geojson);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["osm_id"], 42);
        assert_eq!(features[0]["properties"]["final_name"], "Testville");
        assert_eq!(features[0]["properties"]["geoid"], "3700001");
    }

    #[tokio::test]
    async fn unreachable_place_source_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.fetch.nominatim_url = format!("{}/search", server.uri());

        assert!(run_build(&config, BuildOptions::default()).await.is_err());
        assert!(!dir.path().join("output").join(GEOJSON_FILE).exists());
    }
}
