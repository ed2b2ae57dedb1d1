use crate::export::{CSV_FILE, GEOJSON_FILE, SITE_MAP_FILE};
use crate::render;
use anyhow::{Context, Result};
use geojson::GeoJson;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// Copies the exported data into `site_dir/data` and writes `site_dir/map.html`
/// from the exported GeoJSON.
pub fn build_site(output_dir: &Path, site_dir: &Path) -> Result<()> {
    copy_data(output_dir, site_dir)?;

    let geojson_path = output_dir.join(GEOJSON_FILE);
    if geojson_path.exists() {
        create_map(site_dir, &geojson_path)?;
    }
    Ok(())
}

pub fn copy_data(output_dir: &Path, site_dir: &Path) -> Result<()> {
    let data_dir = site_dir.join("data");
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create site data directory: {:?}", data_dir))?;

    for name in [GEOJSON_FILE, CSV_FILE] {
        let src = output_dir.join(name);
        let dst = data_dir.join(name);
        if !src.exists() {
            warn!("{:?} not found. Nothing copied.", src);
            continue;
        }
        match fs::copy(&src, &dst) {
            Ok(_) => info!("Copied {:?} -> {:?}", src, dst),
            Err(e) => error!("Failed to copy {:?}: {}", src, e),
        }
    }
    Ok(())
}

/// Embeds the GeoJSON in `map.html`, or writes a placeholder page when the
/// file holds no features.
pub fn create_map(site_dir: &Path, geojson_path: &Path) -> Result<()> {
    let map_html = site_dir.join(SITE_MAP_FILE);

    let text = match fs::read_to_string(geojson_path) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to read {:?} for embedding: {}", geojson_path, e);
            return render::render_empty_site_map(&map_html);
        }
    };

    let feature_count = match text.parse::<GeoJson>() {
        Ok(GeoJson::FeatureCollection(fc)) => fc.features.len(),
        Ok(GeoJson::Feature(_)) => 1,
        Ok(GeoJson::Geometry(_)) => 0,
        Err(e) => {
            error!("Invalid GeoJSON in {:?}: {}", geojson_path, e);
            0
        }
    };

    if feature_count == 0 {
        info!("No features in {:?}; writing placeholder map", geojson_path);
        return render::render_empty_site_map(&map_html);
    }

    render::render_site_map(&map_html, &text)?;
    info!("Written interactive map with {} features: {:?}", feature_count, map_html);
    Ok(())
}
