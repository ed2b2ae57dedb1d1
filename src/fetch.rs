//! Remote sources: state boundary lookup (Nominatim), place features
//! (Overpass) and Census TIGER place boundaries.
//!
//! All requests go through [`HttpClient`], which retries transient failures
//! with exponential backoff. Requests are issued one at a time.

use crate::config::FetchConfig;
use crate::data::load_boundary_shapefile;
use crate::types::{BoundaryPolygon, BoundingBox, LocalityRecord, SourceKind};
use anyhow::{anyhow, Context, Result};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::Point;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];
const SHAPEFILE_PARTS: [&str; 5] = ["shp", "shx", "dbf", "prj", "cpg"];

const STATE_TIMEOUT: Duration = Duration::from_secs(60);
const OVERPASS_TIMEOUT: Duration = Duration::from_secs(600);
const CENSUS_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (0-based): `backoff * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.min(16))
    }
}

/// HTTP client shared by the fetchers, carrying its retry policy.
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff: config.backoff(),
            },
        })
    }

    /// Sends the request built by `request`, rebuilding it for each retry.
    ///
    /// Connection errors, timeouts and 429/5xx gateway statuses are retried.
    /// Once retries are exhausted the last response (or error) is returned as-is.
    async fn send<F>(&self, request: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let outcome = request(&self.client).send().await;
            let retryable = match &outcome {
                Ok(resp) => RETRY_STATUSES.contains(&resp.status().as_u16()),
                Err(e) => e.is_connect() || e.is_timeout(),
            };

            if !retryable || attempt >= self.retry.max_retries {
                return outcome.map_err(Into::into);
            }

            let delay = self.retry.delay(attempt);
            match &outcome {
                Ok(resp) => warn!(status = %resp.status(), attempt = attempt + 1, ?delay, "retrying request"),
                Err(e) => warn!(error = %e, attempt = attempt + 1, ?delay, "retrying request"),
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// One Nominatim search result.
#[derive(Debug, Clone, Deserialize)]
pub struct NominatimPlace {
    #[serde(default)]
    pub osm_type: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub geojson: Option<geojson::Geometry>,
}

impl NominatimPlace {
    /// Bounding box of the returned outline; `None` for point results.
    pub fn bbox(&self) -> Option<BoundingBox> {
        let geometry: geo::Geometry<f64> = self.geojson.clone()?.value.try_into().ok()?;
        let rect = geometry.bounding_rect()?;
        if rect.width() <= 0.0 || rect.height() <= 0.0 {
            return None;
        }
        Some(BoundingBox {
            south: rect.min().y,
            west: rect.min().x,
            north: rect.max().y,
            east: rect.max().x,
        })
    }
}

pub async fn fetch_state_polygon(client: &HttpClient, url: &str, state: &str) -> Result<NominatimPlace> {
    info!("Fetching state polygon for {} from Nominatim...", state);

    let resp = client
        .send(|c| {
            c.get(url)
                .query(&[("q", state), ("format", "jsonv2"), ("polygon_geojson", "1")])
                .timeout(STATE_TIMEOUT)
        })
        .await
        .with_context(|| format!("Network error fetching state polygon for {}", state))?;

    let items: Vec<NominatimPlace> = resp
        .error_for_status()
        .context("State polygon lookup failed")?
        .json()
        .await
        .context("JSON decode error fetching state polygon")?;

    pick_state_place(items).ok_or_else(|| anyhow!("State polygon for {} not found via Nominatim", state))
}

// First relation/way carrying an outline, else whatever came first
fn pick_state_place(mut items: Vec<NominatimPlace>) -> Option<NominatimPlace> {
    let preferred = items.iter().position(|item| {
        matches!(item.osm_type.as_deref(), Some("relation") | Some("way")) && item.geojson.is_some()
    });
    match preferred {
        Some(idx) => Some(items.swap_remove(idx)),
        None => items.into_iter().next(),
    }
}

pub fn overpass_query(bbox: &BoundingBox) -> String {
    let b = bbox.to_overpass();
    format!(
        "[out:json][timeout:300];(node[\"place\"]({b});way[\"place\"]({b});relation[\"place\"]({b}););out center tags;"
    )
}

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    element_type: String,
    id: i64,
    lat: Option<f64>,
    lon: Option<f64>,
    center: Option<OverpassCenter>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Deserialize)]
struct OverpassCenter {
    lat: f64,
    lon: f64,
}

/// Turns an Overpass `out center tags` response into place points.
/// Nodes use their own position, ways and relations their center; elements
/// without either are skipped.
pub fn parse_overpass_places(body: &str) -> Result<Vec<LocalityRecord>> {
    let parsed: OverpassResponse = serde_json::from_str(body)
        .context("JSON decode error reading Overpass response")?;
    info!("Received {} elements from Overpass.", parsed.elements.len());

    let mut places = Vec::with_capacity(parsed.elements.len());

    for el in parsed.elements {
        let source_kind = match el.element_type.parse::<SourceKind>() {
            Ok(kind @ (SourceKind::Node | SourceKind::Way | SourceKind::Relation)) => kind,
            _ => {
                debug!(kind = %el.element_type, id = el.id, "skipping element of unexpected type");
                continue;
            }
        };

        let position = match source_kind {
            SourceKind::Node => el.lat.zip(el.lon),
            _ => el.center.as_ref().map(|c| (c.lat, c.lon)),
        };
        let Some((lat, lon)) = position else {
            debug!(id = el.id, "skipping element without a position");
            continue;
        };

        places.push(LocalityRecord {
            source_id: el.id,
            source_kind,
            raw_name: el.tags.get("name").cloned(),
            final_name: None,
            place: el.tags.get("place").cloned(),
            population: el.tags.get("population").cloned(),
            geoid: None,
            point: Point::new(lon, lat),
        });
    }

    if places.is_empty() {
        warn!("No valid places found in OSM data.");
    }

    Ok(places)
}

pub async fn fetch_osm_places(client: &HttpClient, url: &str, bbox: &BoundingBox) -> Result<Vec<LocalityRecord>> {
    let query = overpass_query(bbox);
    info!("Querying Overpass API for places in {}...", bbox.to_overpass());

    let body = client
        .send(|c| c.post(url).form(&[("data", query.as_str())]).timeout(OVERPASS_TIMEOUT))
        .await
        .context("Network error fetching OSM places")?
        .error_for_status()
        .context("Overpass query failed")?
        .text()
        .await
        .context("Failed to read Overpass response")?;

    parse_overpass_places(&body)
}

pub fn census_url(base: &str, year: u16, state_fips: &str) -> String {
    format!("{}TIGER{}/PLACE/tl_{}_{}_place.zip", base, year, year, state_fips)
}

/// Downloads one TIGER place archive and reads its boundaries.
pub async fn fetch_census_places(
    client: &HttpClient,
    base: &str,
    state_fips: &str,
    year: u16,
) -> Result<Vec<BoundaryPolygon>> {
    let url = census_url(base, year, state_fips);
    info!("Downloading Census TIGER shapefile from {}...", url);

    let resp = client
        .send(|c| c.get(&url).timeout(CENSUS_TIMEOUT))
        .await
        .context("Network error downloading Census data")?;
    if resp.status() != StatusCode::OK {
        return Err(anyhow!(
            "Failed to download census TIGER {} place shapefile. Status: {}",
            year,
            resp.status()
        ));
    }
    let bytes = resp.bytes().await.context("Failed to read Census download")?;
    debug!(bytes = bytes.len(), "TIGER archive downloaded");

    let workdir = tempfile::tempdir().context("Failed to create temporary directory")?;
    let shp = extract_shapefile(&bytes, workdir.path())?;

    info!("Reading shapefile...");
    load_boundary_shapefile(&shp)
}

/// Unpacks the shapefile members of a zip archive into `dir` and returns the `.shp` path.
pub fn extract_shapefile(archive_bytes: &[u8], dir: &Path) -> Result<PathBuf> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
        .context("Census download is not a valid zip archive")?;
    let mut shp_path = None;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(file_name) = entry.enclosed_name().and_then(|p| p.file_name()).map(PathBuf::from) else {
            continue;
        };
        let ext = file_name.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !SHAPEFILE_PARTS.contains(&ext.as_str()) {
            continue;
        }

        let out_path = dir.join(&file_name);
        let mut out = File::create(&out_path)
            .with_context(|| format!("Failed to create {:?}", out_path))?;
        io::copy(&mut entry, &mut out)?;

        if ext == "shp" {
            shp_path = Some(out_path);
        }
    }

    shp_path.ok_or_else(|| anyhow!("No .shp file found in archive"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(max_retries: u32) -> HttpClient {
        HttpClient::new(&FetchConfig {
            max_retries,
            backoff_ms: 0,
            ..FetchConfig::default()
        })
        .unwrap()
    }

    fn nc_bbox() -> BoundingBox {
        BoundingBox { south: 33.8, west: -84.3, north: 36.6, east: -75.4 }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy { max_retries: 5, backoff: Duration::from_millis(100) };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn overpass_query_covers_all_element_kinds() {
        let q = overpass_query(&nc_bbox());
        assert!(q.starts_with("[out:json][timeout:300];"));
        assert!(q.contains("node[\"place\"](33.8,-84.3,36.6,-75.4);"));
        assert!(q.contains("way[\"place\"](33.8,-84.3,36.6,-75.4);"));
        assert!(q.contains("relation[\"place\"](33.8,-84.3,36.6,-75.4);"));
        assert!(q.ends_with("out center tags;"));
    }

    #[test]
    fn overpass_elements_become_places() {
        let body = json!({
            "elements": [
                {"type": "node", "id": 1, "lat": 35.78, "lon": -78.64,
                 "tags": {"name": "Raleigh", "place": "city", "population": "467665"}},
                {"type": "way", "id": 2, "center": {"lat": 35.0, "lon": -80.0},
                 "tags": {"place": "hamlet"}},
                {"type": "relation", "id": 3, "tags": {"name": "No Center"}},
                {"type": "area", "id": 4, "lat": 1.0, "lon": 1.0}
            ]
        })
        .to_string();

        let places = parse_overpass_places(&body).unwrap();
        assert_eq!(places.len(), 2);
        assert_eq!(places[0].source_kind, SourceKind::Node);
        assert_eq!(places[0].raw_name.as_deref(), Some("Raleigh"));
        assert_eq!(places[0].population.as_deref(), Some("467665"));
        assert_eq!(places[0].point, Point::new(-78.64, 35.78));
        assert_eq!(places[1].source_kind, SourceKind::Way);
        assert_eq!(places[1].raw_name, None);
        assert_eq!(places[1].point, Point::new(-80.0, 35.0));
    }

    #[test]
    fn census_url_layout() {
        assert_eq!(
            census_url("https://www2.census.gov/geo/tiger/", 2024, "37"),
            "https://www2.census.gov/geo/tiger/TIGER2024/PLACE/tl_2024_37_place.zip"
        );
    }

    #[tokio::test]
    async fn state_lookup_prefers_outlined_relation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "North Carolina"))
            .and(query_param("polygon_geojson", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"osm_type": "node", "display_name": "NC node",
                 "geojson": {"type": "Point", "coordinates": [-79.0, 35.5]}},
                {"osm_type": "relation", "display_name": "North Carolina",
                 "geojson": {"type": "Polygon", "coordinates": [[
                     [-84.3, 33.8], [-75.4, 33.8], [-75.4, 36.6], [-84.3, 36.6], [-84.3, 33.8]
                 ]]}}
            ])))
            .mount(&server)
            .await;

        let client = test_client(0);
        let place = fetch_state_polygon(&client, &format!("{}/search", server.uri()), "North Carolina")
            .await
            .unwrap();
        assert_eq!(place.display_name.as_deref(), Some("North Carolina"));
        assert_eq!(place.bbox(), Some(nc_bbox()));
    }

    #[tokio::test]
    async fn state_lookup_without_results_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = test_client(0);
        let err = fetch_state_polygon(&client, &format!("{}/search", server.uri()), "Nowhere")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/interpreter"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/interpreter"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "elements": [{"type": "node", "id": 9, "lat": 35.5, "lon": -79.0,
                              "tags": {"name": "Retry Town", "place": "town"}}]
            })))
            .mount(&server)
            .await;

        let client = test_client(3);
        let places = fetch_osm_places(&client, &format!("{}/api/interpreter", server.uri()), &nc_bbox())
            .await
            .unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].raw_name.as_deref(), Some("Retry Town"));
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(2);
        let result = fetch_osm_places(&client, &format!("{}/api/interpreter", server.uri()), &nc_bbox()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connection_errors_are_retried_with_backoff() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let client = HttpClient::new(&FetchConfig {
            max_retries: 3,
            backoff_ms: 20,
            ..FetchConfig::default()
        })
        .unwrap();

        let started = std::time::Instant::now();
        let result = fetch_osm_places(&client, &format!("http://127.0.0.1:{}/api/interpreter", port), &nc_bbox()).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        // 20 + 40 + 80 ms of backoff before giving up
        assert!(elapsed >= Duration::from_millis(140), "gave up after {:?}", elapsed);
    }

    #[tokio::test]
    async fn census_missing_year_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(2);
        let base = format!("{}/geo/tiger/", server.uri());
        assert!(fetch_census_places(&client, &base, "37", 2031).await.is_err());
    }

    /// Zipped TIGER-style place layer: one square "Testville" (GEOID 3700001)
    /// spanning -79.1..-78.9 by 35.4..35.6.
    pub(crate) fn tiger_zip() -> Vec<u8> {
        use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
        use shapefile::PolygonRing;

        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("tl_2024_37_place.shp");
        let table = TableWriterBuilder::new()
            .add_character_field(FieldName::try_from("GEOID").unwrap(), 16)
            .add_character_field(FieldName::try_from("NAME").unwrap(), 64);
        {
            let mut writer = shapefile::Writer::from_path(&shp, table).unwrap();
            let polygon = shapefile::Polygon::new(PolygonRing::Outer(vec![
                shapefile::Point::new(-79.1, 35.4),
                shapefile::Point::new(-79.1, 35.6),
                shapefile::Point::new(-78.9, 35.6),
                shapefile::Point::new(-78.9, 35.4),
                shapefile::Point::new(-79.1, 35.4),
            ]));
            let mut record = Record::default();
            record.insert("GEOID".to_string(), FieldValue::Character(Some("3700001".to_string())));
            record.insert("NAME".to_string(), FieldValue::Character(Some("Testville".to_string())));
            writer.write_shape_and_record(&polygon, &record).unwrap();
        }

        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::FileOptions::default();
            for ext in ["shp", "shx", "dbf"] {
                let member = shp.with_extension(ext);
                zip.start_file(member.file_name().unwrap().to_string_lossy(), options).unwrap();
                zip.write_all(&std::fs::read(&member).unwrap()).unwrap();
            }
            zip.start_file("tl_2024_37_place.shp.xml", options).unwrap();
            zip.write_all(b"<metadata/>").unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[tokio::test]
    async fn census_archive_is_unpacked_and_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geo/tiger/TIGER2024/PLACE/tl_2024_37_place.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tiger_zip()))
            .mount(&server)
            .await;

        let client = test_client(0);
        let base = format!("{}/geo/tiger/", server.uri());
        let boundaries = fetch_census_places(&client, &base, "37", 2024).await.unwrap();
        assert_eq!(boundaries.len(), 1);
        assert_eq!(boundaries[0].geoid, "3700001");
        assert_eq!(boundaries[0].name, "Testville");
    }

    #[test]
    fn archive_without_shapefile_is_rejected() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("readme.txt", zip::write::FileOptions::default()).unwrap();
            zip.write_all(b"nothing here").unwrap();
            zip.finish().unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_shapefile(&buf.into_inner(), dir.path()).is_err());
        assert!(extract_shapefile(b"not a zip", dir.path()).is_err());
    }
}
