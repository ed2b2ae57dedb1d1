use crate::crs::{reproject_multipolygon, Crs};
use crate::types::{BoundaryPolygon, LocalityRecord, MineralCategory, MineralSite, SourceKind};
use anyhow::{Context, Result, anyhow};
use csv::{ReaderBuilder, Trim, Writer};
use geo::{MultiPolygon, Point};
use serde_json::{Map, Value};
use shapefile::dbase::FieldValue;
use shapefile::Reader;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use tracing::{error, info, warn};

const MINERAL_COLUMNS: [&str; 5] = ["name", "mineral_type", "description", "latitude", "longitude"];

/// Loads the curated mineral CSV as locality records.
///
/// Never fails: a missing or unreadable file is logged and reported as `None`
/// so the caller can carry on without mineral sites.
pub fn load_mineral_localities(path: &Path) -> Option<Vec<LocalityRecord>> {
    info!("Loading mineral localities from {:?}", path);

    if !path.exists() {
        error!("Mineral localities CSV not found: {:?}", path);
        return None;
    }

    match read_mineral_sites(path) {
        Ok(sites) => {
            info!("Loaded {} mineral localities from CSV", sites.len());
            Some(
                sites.into_iter()
                    .enumerate()
                    .map(|(i, site)| site.into_locality(i as i64 + 1))
                    .collect(),
            )
        }
        Err(e) => {
            error!("Failed to load mineral localities from {:?}: {:#}", path, e);
            None
        }
    }
}

pub fn read_mineral_sites(path: &Path) -> Result<Vec<MineralSite>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open mineral CSV: {:?}", path))?;
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(file);
    let headers = rdr.headers()?.clone();

    let column = |name: &str| {
        headers.iter().position(|h| h == name)
            .ok_or_else(|| anyhow!("Column '{}' not found in mineral CSV", name))
    };
    let name_idx = column("name")?;
    let type_idx = column("mineral_type")?;
    let desc_idx = column("description")?;
    let lat_idx = column("latitude")?;
    let lon_idx = column("longitude")?;

    let mut sites = Vec::new();

    for (row, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {} of {:?}", row + 1, path))?;
        let name = record.get(name_idx).unwrap_or("").to_string();

        let lat = record.get(lat_idx).unwrap_or("").parse::<f64>();
        let lon = record.get(lon_idx).unwrap_or("").parse::<f64>();
        let point = match (lat, lon) {
            (Ok(lat), Ok(lon)) if lat.is_finite() && lon.is_finite() => Point::new(lon, lat),
            _ => {
                warn!("Skipping mineral site '{}' (row {}): bad coordinates", name, row + 1);
                continue;
            }
        };

        let tag = record.get(type_idx).unwrap_or("");
        let category = tag.parse::<MineralCategory>().unwrap_or_else(|_| {
            warn!("Unknown mineral type '{}' for '{}', using 'other'", tag, name);
            MineralCategory::Other
        });

        sites.push(MineralSite {
            name,
            category,
            description: record.get(desc_idx).unwrap_or("").to_string(),
            point,
        });
    }

    Ok(sites)
}

/// Writes sites in the format `read_mineral_sites` expects.
pub fn write_mineral_sites(sites: &[MineralSite], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    let mut wtr = Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {:?}", path))?;
    wtr.write_record(MINERAL_COLUMNS)?;
    for site in sites {
        let lat = site.point.y().to_string();
        let lon = site.point.x().to_string();
        wtr.write_record([
            site.name.as_str(),
            site.category.as_str(),
            site.description.as_str(),
            lat.as_str(),
            lon.as_str(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Reads TIGER-style place boundaries (`GEOID`, `NAME`) and reprojects them to WGS84.
pub fn load_boundary_shapefile(path: &Path) -> Result<Vec<BoundaryPolygon>> {
    let crs = match fs::read_to_string(path.with_extension("prj")) {
        Ok(wkt) => Crs::from_prj(&wkt)
            .with_context(|| format!("Failed to determine CRS of {:?}", path))?,
        Err(_) => {
            warn!("No .prj beside {:?}; assuming NAD83 geographic", path);
            Crs::Nad83
        }
    };

    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut boundaries = Vec::new();

    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let geoid = match record.get("GEOID") {
            Some(FieldValue::Character(Some(s))) => s.trim().to_string(),
            Some(FieldValue::Character(None)) => continue,
            Some(_) => return Err(anyhow!("Shapefile GEOID column must be a string")),
            None => return Err(anyhow!("Column 'GEOID' not found in Shapefile")),
        };
        let name = match record.get("NAME") {
            Some(FieldValue::Character(Some(s))) => s.trim().to_string(),
            _ => String::new(),
        };

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygon {}: {:?}", geoid, e))?,
            shapefile::Shape::PolygonM(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM {}: {:?}", geoid, e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ {}: {:?}", geoid, e))?,
            _ => continue, // Skip non-polygon shapes
        };

        boundaries.push(BoundaryPolygon {
            geoid,
            name,
            geometry: reproject_multipolygon(&geometry, crs),
        });
    }

    Ok(boundaries)
}

/// Reads an exported localities FeatureCollection back into records.
/// Features without a point geometry are skipped.
pub fn load_localities_geojson(path: &Path) -> Result<Vec<LocalityRecord>> {
    use geojson::{GeoJson, Value as GeoValue};

    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let geojson = GeoJson::from_reader(BufReader::new(file)).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut records = Vec::new();

    for (i, feature) in collection.features.into_iter().enumerate() {
        let point = match feature.geometry.map(|g| g.value) {
            Some(GeoValue::Point(pos)) if pos.len() >= 2 => Point::new(pos[0], pos[1]),
            _ => continue,
        };
        let props = feature.properties.unwrap_or_default();

        let source_kind = prop_string(&props, "osm_type")
            .and_then(|s| s.parse::<SourceKind>().ok())
            .unwrap_or(SourceKind::Node);
        let source_id = props.get("osm_id")
            .and_then(|v| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .unwrap_or(i as i64 + 1);
        let final_name = prop_string(&props, "final_name")
            .or_else(|| prop_string(&props, "NAME"))
            .or_else(|| prop_string(&props, "name"));

        records.push(LocalityRecord {
            source_id,
            source_kind,
            raw_name: None,
            final_name,
            place: prop_string(&props, "place"),
            population: prop_string(&props, "population"),
            geoid: prop_string(&props, "geoid"),
            point,
        });
    }

    Ok(records)
}

fn prop_string(props: &Map<String, Value>, key: &str) -> Option<String> {
    match props.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
