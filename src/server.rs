use crate::data::load_localities_geojson;
use crate::export::GEOJSON_FILE;
use crate::types::LocalityRecord;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

// Locality position for nearest-neighbour lookups
struct LocalityPoint {
    index: usize,
    position: [f64; 2],
}

impl RTreeObject for LocalityPoint {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for LocalityPoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        dx * dx + dy * dy
    }
}

pub struct AppState {
    localities: Vec<LocalityRecord>,
    tree: RTree<LocalityPoint>,
}

impl AppState {
    pub fn new(localities: Vec<LocalityRecord>) -> Self {
        let items = localities
            .iter()
            .enumerate()
            .map(|(index, r)| LocalityPoint {
                index,
                position: [r.point.x(), r.point.y()],
            })
            .collect();
        Self {
            tree: RTree::bulk_load(items),
            localities,
        }
    }
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct NearestParams {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LocalitySummary {
    osm_id: i64,
    osm_type: String,
    name: Option<String>,
    place: Option<String>,
    population: Option<String>,
    geoid: Option<String>,
    lon: f64,
    lat: f64,
}

impl From<&LocalityRecord> for LocalitySummary {
    fn from(r: &LocalityRecord) -> Self {
        Self {
            osm_id: r.source_id,
            osm_type: r.source_kind.as_str().to_string(),
            name: r.final_name.clone(),
            place: r.place.clone(),
            population: r.population.clone(),
            geoid: r.geoid.clone(),
            lon: r.point.x(),
            lat: r.point.y(),
        }
    }
}

/// Serves `site_dir` as static files alongside a small query API over the
/// site's locality GeoJSON.
pub async fn start_server(site_dir: &Path, port: u16) -> Result<()> {
    let data_path = site_dir.join("data").join(GEOJSON_FILE);
    let localities = if data_path.exists() {
        load_localities_geojson(&data_path)?
    } else {
        warn!("{:?} not found; API will return no localities", data_path);
        Vec::new()
    };
    info!("Indexed {} localities for the API", localities.len());

    let app = router(Arc::new(AppState::new(localities)), site_dir.to_path_buf());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<AppState>, site_dir: PathBuf) -> Router {
    Router::new()
        .route("/api/localities", get(localities_handler))
        .route("/api/nearest", get(nearest_handler))
        .fallback_service(ServeDir::new(site_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn localities_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<LocalitySummary>> {
    let needle = params.q.map(|q| q.trim().to_lowercase()).filter(|q| !q.is_empty());
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let matches = state
        .localities
        .iter()
        .filter(|r| match &params.category {
            Some(category) => r.place.as_deref() == Some(category.as_str()),
            None => true,
        })
        .filter(|r| match &needle {
            Some(needle) => r.display_name().to_lowercase().contains(needle),
            None => true,
        })
        .take(limit)
        .map(LocalitySummary::from)
        .collect();

    Json(matches)
}

async fn nearest_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearestParams>,
) -> Json<Option<LocalitySummary>> {
    let nearest = state
        .tree
        .nearest_neighbor(&[params.lon, params.lat])
        .and_then(|hit| state.localities.get(hit.index))
        .map(LocalitySummary::from);
    Json(nearest)
}
