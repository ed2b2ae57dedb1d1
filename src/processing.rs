use crate::types::{dedup_key, BoundaryPolygon, LocalityRecord, MergedLocalityTable};
use anyhow::{anyhow, Result};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::contains::Contains;
use geo::Point;
use rstar::{RTree, RTreeObject, AABB};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info};

// Envelope of one boundary, pointing back into the input slice
struct BoundaryEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for BoundaryEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Spatial lookup over place boundaries.
pub struct BoundaryIndex<'a> {
    boundaries: &'a [BoundaryPolygon],
    tree: RTree<BoundaryEnvelope>,
}

impl<'a> BoundaryIndex<'a> {
    pub fn build(boundaries: &'a [BoundaryPolygon]) -> Result<Self> {
        let items = boundaries.iter().enumerate().map(|(index, boundary)| {
            let rect = boundary.geometry.bounding_rect()
                .ok_or_else(|| anyhow!("Boundary {} has an empty geometry", boundary.geoid))?;
            Ok(BoundaryEnvelope {
                index,
                aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            })
        }).collect::<Result<Vec<_>>>()?;

        Ok(Self {
            boundaries,
            tree: RTree::bulk_load(items),
        })
    }

    /// The boundary whose interior contains `point`. Points on an edge are
    /// not within. Overlaps resolve to the earliest boundary in input order.
    pub fn containing(&self, point: &Point<f64>) -> Option<&'a BoundaryPolygon> {
        let envelope = AABB::from_point([point.x(), point.y()]);
        self.tree.locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| self.boundaries[candidate.index].geometry.contains(point))
            .map(|candidate| candidate.index)
            .min()
            .map(|index| &self.boundaries[index])
    }
}

/// Joins place points against boundaries and collapses duplicates.
///
/// Every place is kept through the join; a record's own (trimmed) name wins
/// over the containing boundary's name. Records are then ranked by population
/// (missing last) with a stable sort and the first record per
/// `lon,lat,name` key survives.
///
/// Returns `Ok(None)` when there are no places to merge.
pub fn merge_localities(
    places: &[LocalityRecord],
    boundaries: &[BoundaryPolygon],
) -> Result<Option<MergedLocalityTable>> {
    if places.is_empty() {
        debug!("no place points to merge");
        return Ok(None);
    }

    if let Some(bad) = places.iter().find(|p| !p.point.x().is_finite() || !p.point.y().is_finite()) {
        return Err(anyhow!(
            "Place {} {} has non-finite coordinates",
            bad.source_kind,
            bad.source_id
        ));
    }

    info!("Merging {} place points against {} boundaries", places.len(), boundaries.len());

    let mut resolved = Vec::with_capacity(places.len());

    if boundaries.is_empty() {
        for place in places {
            resolved.push(LocalityRecord {
                raw_name: None,
                final_name: place.raw_name.clone(),
                geoid: None,
                ..place.clone()
            });
        }
    } else {
        let index = BoundaryIndex::build(boundaries)?;
        let mut matched = 0usize;

        for place in places {
            let boundary = index.containing(&place.point);
            if boundary.is_some() {
                matched += 1;
            }

            let own_name = place.raw_name.as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            let boundary_name = boundary
                .map(|b| b.name.clone())
                .filter(|n| !n.is_empty());

            resolved.push(LocalityRecord {
                raw_name: None,
                final_name: own_name.or(boundary_name),
                geoid: boundary.map(|b| b.geoid.clone()),
                ..place.clone()
            });
        }

        info!("{} of {} places fall within a boundary", matched, places.len());
    }

    // sort_by is stable: equal ranks keep input order
    resolved.sort_by(|a, b| by_population_desc(a.population_rank(), b.population_rank()));

    let mut seen = HashSet::new();
    resolved.retain(|r| seen.insert(dedup_key(&r.point, r.final_name.as_deref())));

    info!("{} localities after deduplication", resolved.len());

    Ok(Some(MergedLocalityTable::from_sorted(resolved)))
}

fn by_population_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
