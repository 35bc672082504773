//! Overpass query links built from seed points.

use crate::seed::{format_coordinate, SearchMode, SeedPoint};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OVERPASS_ENDPOINT: &str = "http://overpass-api.de/api/interpreter";
pub const DEFAULT_RADIUS_M: u32 = 200;

/// A ready-to-send query URL plus the dedup key of the seed it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLink {
    pub url: String,
    pub key: String,
}

/// Builds [`QueryLink`]s for one search mode.
#[derive(Clone, Debug)]
pub struct LinkBuilder {
    endpoint: String,
    mode: SearchMode,
    radius_m: u32,
}

impl LinkBuilder {
    pub fn new(endpoint: impl Into<String>, mode: SearchMode, radius_m: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            mode,
            radius_m,
        }
    }

    pub fn build(&self, seed: &SeedPoint) -> QueryLink {
        let query = match self.mode {
            SearchMode::Radius => radius_query(seed, self.radius_m),
            SearchMode::Boundary => boundary_query(seed),
        };

        QueryLink {
            url: format!("{}?data={}", self.endpoint, query),
            key: seed.dedup_key(),
        }
    }

    pub fn build_all(&self, seeds: &[SeedPoint]) -> Vec<QueryLink> {
        seeds.iter().map(|seed| self.build(seed)).collect()
    }
}

fn radius_query(seed: &SeedPoint, radius_m: u32) -> String {
    let around = format!(
        "around:{radius_m},{},{}",
        format_coordinate(seed.lat),
        format_coordinate(seed.lon)
    );
    format!(
        "[out:json][timeout:300];(way[\"building\"]({around});relation[\"building\"]({around}););out body;>;out skel qt;"
    )
}

fn boundary_query(seed: &SeedPoint) -> String {
    // A seed without a north-east corner degenerates to a zero-area box.
    let (north, east) = seed
        .extent
        .map_or((seed.lat, seed.lon), |corner| (corner.lat, corner.lon));
    let bbox = [seed.lat, seed.lon, north, east]
        .map(format_coordinate)
        .join(",");
    format!(
        "[out:json][timeout:300];(way[\"building\"]({bbox});relation[\"building\"][\"type\"=\"multipolygon\"]({bbox}););out;>;out qt;"
    )
}
