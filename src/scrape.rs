//! Recovers mineral sites from a saved Leaflet map page.
//!
//! Each `L.circleMarker(` call in the page starts a fragment holding the
//! marker position and, further on, its popup HTML. Fragments without a
//! position are ignored; fragments that fail to parse are logged and skipped.

use crate::data::write_mineral_sites;
use crate::types::{MineralCategory, MineralSite};
use anyhow::{anyhow, Context, Result};
use geo::Point;
use regex::Regex;
use scraper::Html;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{error, info, warn};

const MARKER_CALL: &str = "L.circleMarker(";
const UNKNOWN_SITE: &str = "Unknown Site";

/// Scrapes `input` and writes the sites to `output` in the mineral CSV format.
/// Returns the number of sites written; nothing is written when none are found.
pub fn scrape_map_file(input: &Path, output: &Path) -> Result<usize> {
    if !input.exists() {
        error!("File not found: {:?}", input);
        return Ok(0);
    }
    let content = fs::read_to_string(input)
        .with_context(|| format!("Failed to read map page: {:?}", input))?;

    let sites = scrape_marker_page(&content);
    if sites.is_empty() {
        warn!("No sites extracted from {:?}", input);
        return Ok(0);
    }

    write_mineral_sites(&sites, output)?;
    info!("Exported {} sites to {:?}", sites.len(), output);

    let mut distribution: BTreeMap<MineralCategory, usize> = BTreeMap::new();
    for site in &sites {
        *distribution.entry(site.category).or_default() += 1;
    }
    for (category, count) in distribution {
        info!("  {:<14} {}", category.as_str(), count);
    }

    Ok(sites.len())
}

pub fn scrape_marker_page(content: &str) -> Vec<MineralSite> {
    let fragments: Vec<&str> = content.split(MARKER_CALL).skip(1).collect();
    info!("Found {} potential markers", fragments.len());

    let mut sites = Vec::new();
    for fragment in fragments {
        match parse_fragment(fragment) {
            Ok(Some(site)) => sites.push(site),
            Ok(None) => {}
            Err(e) => error!("Error parsing marker: {:#}", e),
        }
    }
    sites
}

fn coords_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([\d.-]+),\s*([\d.-]+)\]").expect("coordinate regex is valid"))
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<h4.*?>(.*?)</h4>").expect("name regex is valid"))
}

fn county_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<strong>County:</strong> (.*?)</p>").expect("county regex is valid"))
}

fn minerals_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<strong>Minerals:</strong>\s*(?:</p>\s*<p[^>]*>)?(.*?)</p>")
            .expect("minerals regex is valid")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex is valid"))
}

fn parse_fragment(fragment: &str) -> Result<Option<MineralSite>> {
    let Some(coords) = coords_re().captures(fragment) else {
        return Ok(None);
    };
    let lat: f64 = coords[1]
        .parse()
        .map_err(|e| anyhow!("bad latitude {:?}: {}", &coords[1], e))?;
    let lon: f64 = coords[2]
        .parse()
        .map_err(|e| anyhow!("bad longitude {:?}: {}", &coords[2], e))?;

    let name = name_re()
        .captures(fragment)
        .map(|c| popup_text(c[1].trim()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| UNKNOWN_SITE.to_string());
    let county = county_re()
        .captures(fragment)
        .map(|c| popup_text(c[1].trim()))
        .unwrap_or_default();
    let minerals = minerals_re()
        .captures(fragment)
        .map(|c| popup_text(c[1].trim()))
        .unwrap_or_default();
    let minerals = whitespace_re().replace_all(&minerals, " ").into_owned();

    Ok(Some(MineralSite {
        category: classify_minerals(&minerals, &name),
        description: format!("{}. {} County.", minerals, county),
        name,
        point: Point::new(lon, lat),
    }))
}

// Plain text of a popup snippet: nested tags are dropped and entities decoded
fn popup_text(s: &str) -> String {
    Html::parse_fragment(s).root_element().text().collect()
}

/// Assigns a category from the mineral list and site name. Rules are checked
/// in order and the first match wins, so rarer metals and gems take
/// precedence over common associations.
pub fn classify_minerals(minerals: &str, name: &str) -> MineralCategory {
    let m = minerals.to_lowercase();
    let n = name.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| m.contains(w));
    let either = |word: &str| m.contains(word) || n.contains(word);

    if any(&["platinum", "palladium"]) {
        MineralCategory::Platinum
    } else if any(&["uraninite", "uranium"]) {
        MineralCategory::Uranium
    } else if any(&["diamond"]) {
        MineralCategory::Gems
    } else if either("emerald") {
        MineralCategory::Emerald
    } else if either("hiddenite") {
        MineralCategory::Hiddenite
    } else if any(&["ruby", "sapphire", "corundum"]) {
        MineralCategory::RubySapphire
    } else if either("gold") {
        MineralCategory::Gold
    } else if either("silver") {
        MineralCategory::Silver
    } else if any(&["copper", "chalcopyrite", "malachite", "azurite"]) {
        MineralCategory::Copper
    } else if any(&["garnet"]) {
        MineralCategory::Garnet
    } else if any(&["gem", "topaz", "beryl", "amethyst", "aquamarine", "tourmaline"]) {
        MineralCategory::Gems
    } else if any(&["iron", "magnetite", "hematite"]) {
        MineralCategory::Iron
    } else if any(&["lithium", "spodumene"]) {
        MineralCategory::Lithium
    } else if any(&["mica", "feldspar", "kaolin", "pyrophyllite"]) {
        MineralCategory::Industrial
    } else {
        MineralCategory::Other
    }
}
