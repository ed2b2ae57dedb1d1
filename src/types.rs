use anyhow::{anyhow, Result};
use geo::{MultiPolygon, Point};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Where a locality record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Node,
    Way,
    Relation,
    MineralSite,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Node => "node",
            SourceKind::Way => "way",
            SourceKind::Relation => "relation",
            SourceKind::MineralSite => "mineral_site",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "node" => Ok(SourceKind::Node),
            "way" => Ok(SourceKind::Way),
            "relation" => Ok(SourceKind::Relation),
            "mineral_site" => Ok(SourceKind::MineralSite),
            other => Err(anyhow!("Unknown source kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalityRecord {
    pub source_id: i64,
    pub source_kind: SourceKind,
    pub raw_name: Option<String>,
    pub final_name: Option<String>,
    pub place: Option<String>,
    // Kept as text; only parsed for ranking
    pub population: Option<String>,
    pub geoid: Option<String>,
    pub point: Point<f64>,
}

impl LocalityRecord {
    /// Numeric population used for ranking. Commas and underscores are
    /// tolerated ("12,345"); anything else that fails to parse ranks as missing.
    pub fn population_rank(&self) -> Option<f64> {
        let raw = self.population.as_deref()?.trim();
        let cleaned: String = raw.chars().filter(|c| *c != ',' && *c != '_').collect();
        cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    pub fn display_name(&self) -> &str {
        self.final_name
            .as_deref()
            .or(self.raw_name.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct BoundaryPolygon {
    pub geoid: String,
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Curated mineral, gem and metal categories, in legend order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MineralCategory {
    Gold,
    Silver,
    Copper,
    Platinum,
    Emerald,
    RubySapphire,
    Garnet,
    Gems,
    Hiddenite,
    Uranium,
    Iron,
    Lithium,
    Industrial,
    Other,
}

impl MineralCategory {
    pub const ALL: [MineralCategory; 14] = [
        MineralCategory::Gold,
        MineralCategory::Silver,
        MineralCategory::Copper,
        MineralCategory::Platinum,
        MineralCategory::Emerald,
        MineralCategory::RubySapphire,
        MineralCategory::Garnet,
        MineralCategory::Gems,
        MineralCategory::Hiddenite,
        MineralCategory::Uranium,
        MineralCategory::Iron,
        MineralCategory::Lithium,
        MineralCategory::Industrial,
        MineralCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MineralCategory::Gold => "gold",
            MineralCategory::Silver => "silver",
            MineralCategory::Copper => "copper",
            MineralCategory::Platinum => "platinum",
            MineralCategory::Emerald => "emerald",
            MineralCategory::RubySapphire => "ruby_sapphire",
            MineralCategory::Garnet => "garnet",
            MineralCategory::Gems => "gems",
            MineralCategory::Hiddenite => "hiddenite",
            MineralCategory::Uranium => "uranium",
            MineralCategory::Iron => "iron",
            MineralCategory::Lithium => "lithium",
            MineralCategory::Industrial => "industrial",
            MineralCategory::Other => "other",
        }
    }

    /// Legend label.
    pub fn label(&self) -> &'static str {
        match self {
            MineralCategory::Gold => "Gold",
            MineralCategory::Silver => "Silver",
            MineralCategory::Copper => "Copper",
            MineralCategory::Platinum => "Platinum",
            MineralCategory::Emerald => "Emerald",
            MineralCategory::RubySapphire => "Ruby/Sapphire",
            MineralCategory::Garnet => "Garnet",
            MineralCategory::Gems => "Multi-Gem",
            MineralCategory::Hiddenite => "Hiddenite",
            MineralCategory::Uranium => "Uranium",
            MineralCategory::Iron => "Iron",
            MineralCategory::Lithium => "Lithium",
            MineralCategory::Industrial => "Industrial",
            MineralCategory::Other => "Other",
        }
    }

    /// Marker colour, hex.
    pub fn color(&self) -> &'static str {
        match self {
            MineralCategory::Gold => "#FFD700",
            MineralCategory::Silver => "#C0C0C0",
            MineralCategory::Copper => "#B87333",
            MineralCategory::Platinum => "#E5E4E2",
            MineralCategory::Emerald => "#50C878",
            MineralCategory::RubySapphire => "#E0115F",
            MineralCategory::Garnet => "#B22222",
            MineralCategory::Gems => "#9370DB",
            MineralCategory::Hiddenite => "#98FF98",
            MineralCategory::Uranium => "#4B5320",
            MineralCategory::Iron => "#8B4513",
            MineralCategory::Lithium => "#6A5ACD",
            MineralCategory::Industrial => "#D2B48C",
            MineralCategory::Other => "#808080",
        }
    }
}

impl fmt::Display for MineralCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MineralCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        MineralCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| anyhow!("Unknown mineral category: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MineralSite {
    pub name: String,
    pub category: MineralCategory,
    pub description: String,
    pub point: Point<f64>,
}

impl MineralSite {
    pub fn into_locality(self, source_id: i64) -> LocalityRecord {
        LocalityRecord {
            source_id,
            source_kind: SourceKind::MineralSite,
            raw_name: Some(self.name.clone()),
            final_name: Some(self.name),
            place: Some(self.category.as_str().to_string()),
            population: None,
            geoid: None,
            point: self.point,
        }
    }
}

/// Query window for the map-feature service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// `south,west,north,east`, the order the Overpass QL filter expects.
    pub fn to_overpass(&self) -> String {
        format!("{},{},{},{}", self.south, self.west, self.north, self.east)
    }
}

/// Deduplicated localities, ordered by descending population.
#[derive(Debug, Clone, Default)]
pub struct MergedLocalityTable {
    records: Vec<LocalityRecord>,
}

impl MergedLocalityTable {
    /// Wraps records the merge engine has already sorted and deduplicated.
    pub(crate) fn from_sorted(records: Vec<LocalityRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[LocalityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends records whose dedup key is not yet present. Returns how many were added.
    pub fn extend_unique(&mut self, extra: Vec<LocalityRecord>) -> usize {
        let mut seen: HashSet<String> = self
            .records
            .iter()
            .map(|r| dedup_key(&r.point, r.final_name.as_deref()))
            .collect();
        let before = self.records.len();
        for record in extra {
            if seen.insert(dedup_key(&record.point, record.final_name.as_deref())) {
                self.records.push(record);
            }
        }
        self.records.len() - before
    }
}

/// Rounds to 6 decimal places using the exact binary value, ties to even.
/// `-0.0` is folded into `0.0` so both hash alike.
pub fn round6(v: f64) -> f64 {
    format!("{:.6}", v).parse::<f64>().unwrap_or(v) + 0.0
}

/// `lon,lat,name` with coordinates rounded to 6 decimals.
pub fn dedup_key(point: &Point<f64>, name: Option<&str>) -> String {
    format!(
        "{},{},{}",
        round6(point.x()),
        round6(point.y()),
        name.unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, x: f64, y: f64) -> LocalityRecord {
        LocalityRecord {
            source_id: 1,
            source_kind: SourceKind::Node,
            raw_name: Some(name.to_string()),
            final_name: Some(name.to_string()),
            place: Some("town".to_string()),
            population: None,
            geoid: None,
            point: Point::new(x, y),
        }
    }

    #[test]
    fn dedup_key_rounds_to_six_decimals() {
        let a = dedup_key(&Point::new(-79.0000001, 35.5000004), Some("A"));
        let b = dedup_key(&Point::new(-79.0, 35.5), Some("A"));
        assert_eq!(a, b);
        let c = dedup_key(&Point::new(-79.000001, 35.5), Some("A"));
        assert_ne!(a, c);
    }

    #[test]
    fn round6_follows_exact_value_not_scaled_product() {
        // -78.6381785 is stored just below the midpoint; scaling by 1e6 lands on .5
        assert_eq!(round6(-78.6381785), -78.638178);
        assert_eq!(round6(35.5000005), 35.5);
        assert_eq!(round6(35.1234565), 35.123457);
        assert_eq!(round6(-0.0000001).to_string(), "0");
    }

    #[test]
    fn dedup_key_uses_empty_name_when_unset() {
        assert!(dedup_key(&Point::new(1.0, 2.0), None).ends_with(','));
    }

    #[test]
    fn population_rank_parses_grouped_numbers() {
        let mut r = record("x", 0.0, 0.0);
        r.population = Some("12,345".into());
        assert_eq!(r.population_rank(), Some(12345.0));
        r.population = Some("about 300".into());
        assert_eq!(r.population_rank(), None);
        r.population = None;
        assert_eq!(r.population_rank(), None);
    }

    #[test]
    fn mineral_category_round_trips_through_str() {
        for c in MineralCategory::ALL {
            assert_eq!(c.as_str().parse::<MineralCategory>().unwrap(), c);
        }
        assert_eq!(
            " Ruby_Sapphire ".parse::<MineralCategory>().unwrap(),
            MineralCategory::RubySapphire
        );
        assert!("quartz".parse::<MineralCategory>().is_err());
    }

    #[test]
    fn extend_unique_skips_existing_keys() {
        let mut table = MergedLocalityTable::from_sorted(vec![record("Mine", -80.0, 35.0)]);
        let added = table.extend_unique(vec![
            record("Mine", -80.0, 35.0),
            record("Other Mine", -80.0, 35.0),
            record("Other Mine", -80.0, 35.0),
        ]);
        assert_eq!(added, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn bbox_formats_south_west_north_east() {
        let bbox = BoundingBox { south: 33.8, west: -84.3, north: 36.6, east: -75.4 };
        assert_eq!(bbox.to_overpass(), "33.8,-84.3,36.6,-75.4");
    }
}
