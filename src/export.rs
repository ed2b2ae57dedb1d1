use crate::crs::WGS84_PRJ;
use crate::render;
use crate::types::{LocalityRecord, MergedLocalityTable};
use anyhow::{anyhow, Context, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use serde::Serialize;
use serde_json::json;
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const GEOJSON_FILE: &str = "nc_localities.geojson";
pub const CSV_FILE: &str = "nc_localities.csv";
pub const SHP_DIR: &str = "nc_localities_shp";
pub const SHP_FILE: &str = "nc_localities.shp";
pub const MAP_FILE: &str = "nc_localities_map.html";
pub const SITE_MAP_FILE: &str = "map.html";

// dBase character fields top out at 254 bytes
const DBF_TEXT_MAX: usize = 254;

#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub geojson: PathBuf,
    pub csv: PathBuf,
    pub shapefile: PathBuf,
    pub map: PathBuf,
}

impl ExportPaths {
    pub fn in_dir(output_dir: &Path) -> Self {
        Self {
            geojson: output_dir.join(GEOJSON_FILE),
            csv: output_dir.join(CSV_FILE),
            shapefile: output_dir.join(SHP_DIR).join(SHP_FILE),
            map: output_dir.join(MAP_FILE),
        }
    }
}

/// Writes GeoJSON, CSV, Shapefile and the HTML map into `output_dir`, then
/// mirrors the data into `site_dir` when that directory exists.
///
/// An absent or empty table is not an error: nothing is written.
pub fn write_exports_and_map(
    table: Option<&MergedLocalityTable>,
    output_dir: &Path,
    site_dir: &Path,
) -> Result<Option<ExportPaths>> {
    let Some(table) = table.filter(|t| !t.is_empty()) else {
        warn!("No data to export.");
        return Ok(None);
    };

    info!("Writing exports to {:?}...", output_dir);
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    let paths = ExportPaths::in_dir(output_dir);
    write_geojson(table, &paths.geojson)?;
    write_csv(table, &paths.csv)?;
    write_shapefile(table, &paths.shapefile)?;
    render::render_localities_map(table, &paths.map)?;

    if site_dir.is_dir() {
        mirror_to_site(table, &paths.map, site_dir)?;
    }

    info!("Exported {} localities", table.len());
    Ok(Some(paths))
}

/// Site copy: data files under `site/data/`, the map page as `site/map.html`.
pub fn mirror_to_site(table: &MergedLocalityTable, map_path: &Path, site_dir: &Path) -> Result<()> {
    let data_dir = site_dir.join("data");
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create site data directory: {:?}", data_dir))?;

    write_geojson(table, &data_dir.join(GEOJSON_FILE))?;
    write_csv(table, &data_dir.join(CSV_FILE))?;

    let site_map = site_dir.join(SITE_MAP_FILE);
    if let Err(e) = fs::copy(map_path, &site_map) {
        warn!("Failed to copy {:?} to site path {:?}: {}", map_path, site_map, e);
    }
    Ok(())
}

pub fn to_feature_collection(table: &MergedLocalityTable) -> FeatureCollection {
    let features = table.records().iter().map(to_feature).collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn to_feature(record: &LocalityRecord) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("osm_id".to_string(), json!(record.source_id));
    properties.insert("osm_type".to_string(), json!(record.source_kind.as_str()));
    properties.insert("final_name".to_string(), json!(record.final_name));
    properties.insert("place".to_string(), json!(record.place));
    properties.insert("population".to_string(), json!(record.population));
    properties.insert("geoid".to_string(), json!(record.geoid));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(GeoValue::Point(vec![record.point.x(), record.point.y()]))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

pub fn write_geojson(table: &MergedLocalityTable, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create GeoJSON file: {:?}", path))?;
    serde_json::to_writer(BufWriter::new(file), &to_feature_collection(table))
        .with_context(|| format!("Failed to write GeoJSON: {:?}", path))?;
    Ok(())
}

#[derive(Serialize)]
struct CsvRow<'a> {
    osm_id: i64,
    osm_type: &'a str,
    final_name: Option<&'a str>,
    place: Option<&'a str>,
    population: Option<&'a str>,
    geoid: Option<&'a str>,
    x: f64,
    y: f64,
}

pub fn write_csv(table: &MergedLocalityTable, path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {:?}", path))?;
    for r in table.records() {
        wtr.serialize(CsvRow {
            osm_id: r.source_id,
            osm_type: r.source_kind.as_str(),
            final_name: r.final_name.as_deref(),
            place: r.place.as_deref(),
            population: r.population.as_deref(),
            geoid: r.geoid.as_deref(),
            x: r.point.x(),
            y: r.point.y(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Point shapefile with the same attributes as the CSV, plus a WGS84 `.prj`.
pub fn write_shapefile(table: &MergedLocalityTable, shp_path: &Path) -> Result<()> {
    if let Some(parent) = shp_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create shapefile directory: {:?}", parent))?;
    }

    let fields = TableWriterBuilder::new()
        .add_numeric_field(field_name("osm_id")?, 18, 0)
        .add_character_field(field_name("osm_type")?, 16)
        .add_character_field(field_name("final_name")?, DBF_TEXT_MAX as u8)
        .add_character_field(field_name("place")?, 64)
        .add_character_field(field_name("population")?, 32)
        .add_character_field(field_name("geoid")?, 16);

    {
        let mut writer = shapefile::Writer::from_path(shp_path, fields)
            .with_context(|| format!("Failed to create Shapefile: {:?}", shp_path))?;

        for r in table.records() {
            let mut record = Record::default();
            record.insert("osm_id".to_string(), FieldValue::Numeric(Some(r.source_id as f64)));
            record.insert("osm_type".to_string(), text(Some(r.source_kind.as_str()), 16));
            record.insert("final_name".to_string(), text(r.final_name.as_deref(), DBF_TEXT_MAX));
            record.insert("place".to_string(), text(r.place.as_deref(), 64));
            record.insert("population".to_string(), text(r.population.as_deref(), 32));
            record.insert("geoid".to_string(), text(r.geoid.as_deref(), 16));

            let point = shapefile::Point::new(r.point.x(), r.point.y());
            writer.write_shape_and_record(&point, &record)
                .with_context(|| format!("Failed to write shape for {} {}", r.source_kind, r.source_id))?;
        }
    }

    fs::write(shp_path.with_extension("prj"), WGS84_PRJ)
        .with_context(|| format!("Failed to write .prj for {:?}", shp_path))?;
    Ok(())
}

fn field_name(name: &str) -> Result<FieldName> {
    FieldName::try_from(name).map_err(|e| anyhow!("Invalid dBase field name {}: {:?}", name, e))
}

// Character value cut to `max` bytes on a char boundary
fn text(value: Option<&str>, max: usize) -> FieldValue {
    FieldValue::Character(value.map(|s| {
        let mut end = s.len().min(max);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }))
}
