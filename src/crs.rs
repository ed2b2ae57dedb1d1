//! Coordinate reference handling for boundary inputs.
//!
//! Everything downstream of loading works in WGS84 longitude/latitude. TIGER
//! shapefiles ship in NAD83 geographic coordinates, which agree with WGS84
//! to within a couple of metres and are taken as-is.

use anyhow::{anyhow, Result};
use geo::{Coord, MapCoords, MultiPolygon};
use std::f64::consts::PI;

const EARTH_RADIUS_M: f64 = 6_378_137.0;

pub const WGS84_PRJ: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    Wgs84,
    Nad83,
    WebMercator,
}

impl Crs {
    /// Detects the reference system from an ESRI `.prj` WKT string.
    pub fn from_prj(wkt: &str) -> Result<Self> {
        let normalized = wkt.to_ascii_uppercase().replace(' ', "_");

        if normalized.contains("WEB_MERCATOR")
            || normalized.contains("PSEUDO-MERCATOR")
            || normalized.contains("POPULAR_VISUALISATION")
        {
            return Ok(Crs::WebMercator);
        }
        if normalized.starts_with("PROJCS") {
            return Err(anyhow!("Unsupported projected CRS in .prj: {}", wkt.trim()));
        }
        if normalized.contains("NORTH_AMERICAN_1983") || normalized.contains("NAD83") {
            return Ok(Crs::Nad83);
        }
        if normalized.contains("WGS_1984") || normalized.contains("WGS_84") || normalized.contains("WGS84") {
            return Ok(Crs::Wgs84);
        }
        Err(anyhow!("Unrecognised CRS in .prj: {}", wkt.trim()))
    }

    pub fn to_wgs84(&self, coord: Coord<f64>) -> Coord<f64> {
        match self {
            Crs::Wgs84 | Crs::Nad83 => coord,
            Crs::WebMercator => mercator_to_lon_lat(coord),
        }
    }
}

pub fn reproject_multipolygon(geometry: &MultiPolygon<f64>, crs: Crs) -> MultiPolygon<f64> {
    geometry.map_coords(|c| crs.to_wgs84(c))
}

fn mercator_to_lon_lat(coord: Coord<f64>) -> Coord<f64> {
    let lon = (coord.x / EARTH_RADIUS_M).to_degrees();
    let lat = (2.0 * (coord.y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees();
    Coord { x: lon, y: lat }
}
