use crate::types::{MergedLocalityTable, MineralCategory, MineralSite};
use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use serde_json::json;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::info;

const LOCALITIES_TEMPLATE: &str = include_str!("../templates/localities_map.html");
const SITE_TEMPLATE: &str = include_str!("../templates/site_map.html");
const EMPTY_SITE_TEMPLATE: &str = include_str!("../templates/empty_site_map.html");
const MINERAL_TEMPLATE: &str = include_str!("../templates/mineral_map.html");

// Lat, lon
const MAP_CENTER: (f64, f64) = (35.5, -79.0);

/// Static Leaflet page with one blue circle marker per locality.
pub fn render_localities_map(table: &MergedLocalityTable, path: &Path) -> Result<()> {
    let mut markers = String::new();
    for r in table.records() {
        let popup = format!(
            "<b>{}</b><br>Place: {}<br>Population: {}<br>OSM ID: {}",
            escape_html(r.display_name()),
            escape_html(r.place.as_deref().unwrap_or("")),
            escape_html(r.population.as_deref().unwrap_or("")),
            r.source_id,
        );
        writeln!(
            markers,
            "L.circleMarker([{}, {}], {{radius: 3, color: \"blue\", fill: true}}).bindPopup({}).addTo(map);",
            r.point.y(),
            r.point.x(),
            js_string(&popup)?,
        )?;
    }

    let html = LOCALITIES_TEMPLATE
        .replace("{{CENTER_LAT}}", &MAP_CENTER.0.to_string())
        .replace("{{CENTER_LON}}", &MAP_CENTER.1.to_string())
        .replace("{{MARKERS}}", &markers);

    write_page(path, &html)?;
    info!("Wrote {} markers to {:?}", table.len(), path);
    Ok(())
}

/// Site map that renders the given GeoJSON text client-side.
pub fn render_site_map(path: &Path, geojson_text: &str) -> Result<()> {
    let html = SITE_TEMPLATE.replace("{{DATA}}", &script_safe(geojson_text));
    write_page(path, &html)
}

pub fn render_empty_site_map(path: &Path) -> Result<()> {
    write_page(path, EMPTY_SITE_TEMPLATE)
}

/// Interactive mineral map: colour per category, filter panel, legend,
/// search box and a reset button. Data is embedded as GeoJSON.
pub fn render_mineral_map(sites: &[MineralSite], path: &Path) -> Result<()> {
    let collection = mineral_feature_collection(sites);
    let data = serde_json::to_string(&collection).context("Failed to encode mineral GeoJSON")?;

    let color_map: JsonObject = MineralCategory::ALL
        .iter()
        .map(|c| (c.as_str().to_string(), json!(c.color())))
        .collect();
    let categories: Vec<[&str; 2]> = MineralCategory::ALL
        .iter()
        .map(|c| [c.as_str(), c.label()])
        .collect();

    let html = MINERAL_TEMPLATE
        .replace("{{DATA}}", &script_safe(&data))
        .replace("{{COLOR_MAP}}", &serde_json::to_string(&color_map)?)
        .replace("{{CATEGORIES}}", &serde_json::to_string(&categories)?);

    write_page(path, &html)?;
    info!("Created mineral map with {} sites at {:?}", sites.len(), path);
    Ok(())
}

fn mineral_feature_collection(sites: &[MineralSite]) -> FeatureCollection {
    let features = sites
        .iter()
        .map(|site| {
            let mut properties = JsonObject::new();
            properties.insert("name".to_string(), json!(site.name));
            properties.insert("mineral_type".to_string(), json!(site.category.as_str()));
            properties.insert("description".to_string(), json!(site.description));
            Feature {
                bbox: None,
                geometry: Some(Geometry::new(GeoValue::Point(vec![site.point.x(), site.point.y()]))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn write_page(path: &Path, html: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    fs::write(path, html).with_context(|| format!("Failed to write map page: {:?}", path))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// JSON string literal that cannot close the surrounding <script>
fn js_string(s: &str) -> Result<String> {
    Ok(script_safe(&serde_json::to_string(s)?))
}

fn script_safe(json: &str) -> String {
    json.replace("</", "<\\/")
}
