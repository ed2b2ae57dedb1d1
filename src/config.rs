use crate::types::BoundingBox;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result};
use tracing::debug;

pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
pub const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
pub const CENSUS_BASE: &str = "https://www2.census.gov/geo/tiger/";
pub const USER_AGENT: &str = "nc-localities/1.0 (+https://example.com)";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub region: RegionConfig,
    pub fetch: FetchConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InputConfig {
    pub mineral_csv: PathBuf,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { mineral_csv: PathBuf::from("data/mineral_localities.csv") }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegionConfig {
    pub state: String,
    pub state_fips: String,
    pub year: u16,
    // Oldest TIGER vintage tried when the requested year is unavailable
    pub min_year: u16,
    // Used when the state lookup yields no area, south/west/north/east
    pub fallback_bbox: [f64; 4],
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            state: "North Carolina".to_string(),
            state_fips: "37".to_string(),
            year: 2025,
            min_year: 2020,
            fallback_bbox: [33.8, -84.3, 36.6, -75.4],
        }
    }
}

impl RegionConfig {
    pub fn fallback_bbox(&self) -> BoundingBox {
        let [south, west, north, east] = self.fallback_bbox;
        BoundingBox { south, west, north, east }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    pub nominatim_url: String,
    pub overpass_url: String,
    pub census_base: String,
    pub user_agent: String,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            nominatim_url: NOMINATIM_URL.to_string(),
            overpass_url: OVERPASS_URL.to_string(),
            census_base: CENSUS_BASE.to_string(),
            user_agent: USER_AGENT.to_string(),
            max_retries: 5,
            backoff_ms: 1000,
        }
    }
}

impl FetchConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub site_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            site_dir: PathBuf::from("site"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }

    /// Loads `path` when it exists; every setting has a default otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            debug!(?path, "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Applies command-line values on top of the loaded settings.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(dir) = overrides.output_dir {
            self.output.output_dir = dir;
        }
        if let Some(dir) = overrides.site_dir {
            self.output.site_dir = dir;
        }
        if let Some(state) = overrides.state {
            self.region.state = state;
        }
        if let Some(fips) = overrides.state_fips {
            self.region.state_fips = fips;
        }
        if let Some(year) = overrides.year {
            self.region.year = year;
        }
        if let Some(csv) = overrides.mineral_csv {
            self.input.mineral_csv = csv;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }
}

/// Settings given on the command line; `None` keeps the file or default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_dir: Option<PathBuf>,
    pub site_dir: Option<PathBuf>,
    pub state: Option<String>,
    pub state_fips: Option<String>,
    pub year: Option<u16>,
    pub mineral_csv: Option<PathBuf>,
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [region]
            year = 2023

            [fetch]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.region.year, 2023);
        assert_eq!(config.region.state_fips, "37");
        assert_eq!(config.fetch.max_retries, 2);
        assert_eq!(config.fetch.overpass_url, OVERPASS_URL);
        assert_eq!(config.output.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.region.state, "North Carolina");
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[region\nyear = ").unwrap();
        assert!(AppConfig::load_or_default(&path).is_err());
    }

    #[test]
    fn command_line_values_win_over_file() {
        let mut config: AppConfig = toml::from_str(
            r#"
            [region]
            state = "Virginia"
            year = 2022

            [output]
            site_dir = "public"
            "#,
        )
        .unwrap();

        config.apply_overrides(Overrides {
            output_dir: Some(PathBuf::from("/tmp/out")),
            year: Some(2024),
            mineral_csv: Some(PathBuf::from("minerals.csv")),
            port: Some(9000),
            ..Overrides::default()
        });

        assert_eq!(config.output.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.region.year, 2024);
        assert_eq!(config.input.mineral_csv, PathBuf::from("minerals.csv"));
        assert_eq!(config.server.port, 9000);
        // Unset overrides keep the file's values
        assert_eq!(config.region.state, "Virginia");
        assert_eq!(config.output.site_dir, PathBuf::from("public"));
        assert_eq!(config.region.state_fips, "37");
    }
}
