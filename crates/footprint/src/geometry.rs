//! Turns one Overpass response into polygon records.
//!
//! Ways are closed into rings from the node coordinates embedded in the same
//! response. Multipolygon relations are too expensive to assemble locally, so
//! their geometry comes from an external WKT service keyed by relation id.

use crate::element::{QueryResponse, RawElement, Tags};
use crate::error::{CollectError, CollectResult};
use crate::link::QueryLink;
use crate::record::PolygonRecord;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const DEFAULT_WKT_ENDPOINT: &str = "https://polygons.openstreetmap.fr/get_wkt.py";

/// A closed ring of `(lon, lat)` points.
#[derive(Clone, Debug, PartialEq)]
pub struct Ring(Vec<(f64, f64)>);

impl Ring {
    pub fn points(&self) -> &[(f64, f64)] {
        &self.0
    }

    pub fn to_wkt(&self) -> String {
        let coords: Vec<String> = self
            .0
            .iter()
            .map(|(lon, lat)| format!("{lon} {lat}"))
            .collect();
        format!("POLYGON (({}))", coords.join(", "))
    }
}

/// Resolves `refs` against `nodes` in order and closes the ring.
pub fn build_ring(
    way_id: i64,
    refs: &[i64],
    nodes: &HashMap<i64, (f64, f64)>,
) -> CollectResult<Ring> {
    let mut points = Vec::with_capacity(refs.len() + 1);
    for node_id in refs {
        let point = nodes
            .get(node_id)
            .copied()
            .ok_or_else(|| CollectError::GeometryResolution {
                kind: "way",
                id: way_id,
                reason: format!("node {node_id} is not in the response"),
            })?;
        points.push(point);
    }

    if let (Some(&first), Some(&last)) = (points.first(), points.last()) {
        if first != last {
            points.push(first);
        }
    }

    // A closed ring needs three distinct corners plus the closing point.
    if points.len() < 4 {
        return Err(CollectError::GeometryResolution {
            kind: "way",
            id: way_id,
            reason: format!("{} points cannot form a closed ring", points.len()),
        });
    }

    Ok(Ring(points))
}

/// Looks up the assembled polygon of a relation.
#[async_trait]
pub trait GeometryLookup: Send + Sync {
    /// Returns WKT with any `SRID=...;` prefix already removed.
    async fn relation_wkt(&self, relation_id: i64) -> CollectResult<String>;
}

/// Removes an EWKT `SRID=<n>;` prefix.
pub fn strip_srid(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("SRID=").and_then(|rest| rest.split_once(';')) {
        Some((_, wkt)) => wkt.trim(),
        None => trimmed,
    }
}

/// [`GeometryLookup`] backed by the polygons.openstreetmap.fr WKT endpoint.
///
/// Requests go out directly, not through the worker's anonymizing proxy.
#[derive(Clone, Debug)]
pub struct WktService {
    client: reqwest::Client,
    endpoint: String,
}

impl WktService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> CollectResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectError::InvalidConfig(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl GeometryLookup for WktService {
    async fn relation_wkt(&self, relation_id: i64) -> CollectResult<String> {
        let failure = |reason: String| CollectError::GeometryResolution {
            kind: "relation",
            id: relation_id,
            reason,
        };

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("id", relation_id)])
            .send()
            .await
            .map_err(|e| failure(format!("lookup request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| failure(format!("lookup body unreadable: {e}")))?;
        if !status.is_success() {
            return Err(failure(format!("lookup returned HTTP {status}")));
        }

        let wkt = strip_srid(&body);
        if wkt.is_empty() || wkt.eq_ignore_ascii_case("none") {
            return Err(failure("lookup returned no geometry".into()));
        }
        Ok(wkt.to_owned())
    }
}

/// What one call to [`reconstruct`] produced, for metrics and logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reconstruction {
    pub relations: usize,
    pub ways: usize,
    pub failures: usize,
}

/// Reconstructs every polygon in `response`, stamping each record's `coord`
/// with `link.key`.
///
/// Relation records come first, then way records. A feature whose geometry
/// cannot be resolved is logged and kept with an empty geometry; it never
/// aborts the batch.
pub async fn reconstruct(
    response: &QueryResponse,
    link: &QueryLink,
    lookup: &dyn GeometryLookup,
) -> (Vec<PolygonRecord>, Reconstruction) {
    let mut nodes: HashMap<i64, (f64, f64)> = HashMap::new();
    let mut ways: Vec<(i64, &[i64], &Tags)> = Vec::new();
    let mut relations = Vec::new();
    for element in &response.elements {
        match element {
            RawElement::Node {
                id,
                lat: Some(lat),
                lon: Some(lon),
                ..
            } => {
                nodes.insert(*id, (*lon, *lat));
            }
            RawElement::Way {
                id,
                nodes: refs,
                tags,
            } => ways.push((*id, refs.as_slice(), tags)),
            RawElement::Relation { id, members, tags } => relations.push((*id, members, tags)),
            _ => {}
        }
    }

    let mut stats = Reconstruction::default();
    let mut records = Vec::new();
    let mut consumed: HashSet<i64> = HashSet::new();

    for (id, members, tags) in relations {
        let mut record = PolygonRecord::from_tags(id, &link.key, tags);
        let is_multipolygon = tags.get("type").is_some_and(|t| t == "multipolygon");
        if is_multipolygon {
            consumed.extend(members.iter().filter(|m| m.is_way()).map(|m| m.reference));
            match lookup.relation_wkt(id).await {
                Ok(wkt) => record.geometry = Some(wkt),
                Err(e) => {
                    stats.failures += 1;
                    tracing::warn!(relation = id, coord = %link.key, error = %e, "Relation geometry lookup failed");
                }
            }
        }
        stats.relations += 1;
        records.push(record);
    }

    for (id, refs, tags) in ways {
        if refs.is_empty() || consumed.contains(&id) {
            continue;
        }
        let mut record = PolygonRecord::from_tags(id, &link.key, tags);
        match build_ring(id, refs, &nodes) {
            Ok(ring) => record.geometry = Some(ring.to_wkt()),
            Err(e) => {
                stats.failures += 1;
                tracing::warn!(way = id, coord = %link.key, error = %e, "Way geometry resolution failed");
            }
        }
        stats.ways += 1;
        records.push(record);
    }

    (records, stats)
}
