//! Seed points read from the input table.

use crate::error::{CollectError, CollectResult};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

/// How a seed point is turned into an Overpass query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Buildings within `radius` metres of the point.
    Radius,
    /// Buildings inside the bounding box spanned by the row.
    Boundary,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchMode::Radius => "radius",
            SearchMode::Boundary => "boundary",
        };

        f.write_str(s)
    }
}

impl FromStr for SearchMode {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "radius" => Ok(SearchMode::Radius),
            "boundary" => Ok(SearchMode::Boundary),
            other => Err(CollectError::InvalidConfig(format!(
                "unknown search mode '{other}' (expected 'radius' or 'boundary')"
            ))),
        }
    }
}

/// North-east corner of a boundary-mode box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Corner {
    pub lat: f64,
    pub lon: f64,
}

/// A single row of the seed table.
///
/// In boundary mode `lat`/`lon` hold the south-west corner and `extent` the
/// north-east corner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeedPoint {
    pub lat: f64,
    pub lon: f64,
    pub extent: Option<Corner>,
}

impl SeedPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            extent: None,
        }
    }

    pub fn with_extent(mut self, lat: f64, lon: f64) -> Self {
        self.extent = Some(Corner { lat, lon });
        self
    }

    /// The `"lon,lat"` key stored in the `coord` column of the buildings table.
    pub fn dedup_key(&self) -> String {
        format!(
            "{},{}",
            format_coordinate(self.lon),
            format_coordinate(self.lat)
        )
    }
}

/// Renders a coordinate the way the buildings table stores it: shortest
/// round-trip decimal, with `.0` kept on integral values (`40.0`, not `40`).
pub fn format_coordinate(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Reads the seed table at `path`.
///
/// Requires `lat` and `lon` columns. Rows where either cell is blank are
/// dropped. Any cell that does not parse for the given `mode` makes the whole
/// table invalid.
pub fn load_seeds(path: &Path, mode: SearchMode) -> CollectResult<Vec<SeedPoint>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| {
            CollectError::InvalidConfig(format!("cannot read seed file {}: {e}", path.display()))
        })?;

    let headers = reader
        .headers()
        .map_err(|e| {
            CollectError::InvalidConfig(format!("seed file {} has no readable header: {e}", path.display()))
        })?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let (lat_idx, lon_idx) = match (column("lat"), column("lon")) {
        (Some(lat), Some(lon)) => (lat, lon),
        (lat, lon) => {
            let missing: Vec<&str> = [("lat", lat), ("lon", lon)]
                .into_iter()
                .filter(|(_, idx)| idx.is_none())
                .map(|(name, _)| name)
                .collect();
            return Err(CollectError::InvalidConfig(format!(
                "seed file {} is missing columns {missing:?}",
                path.display()
            )));
        }
    };

    let mut seeds = Vec::new();
    for (row, record) in reader.records().enumerate() {
        // Header is line 1.
        let line = row + 2;
        let record = record.map_err(|e| {
            CollectError::InvalidConfig(format!("line {line}: malformed seed row: {e}"))
        })?;
        let lat = record.get(lat_idx).unwrap_or_default();
        let lon = record.get(lon_idx).unwrap_or_default();
        if lat.is_empty() || lon.is_empty() {
            continue;
        }

        let seed = match mode {
            SearchMode::Radius => SeedPoint::new(parse_float(lat, line)?, parse_float(lon, line)?),
            SearchMode::Boundary => {
                let (south, west) = parse_pair(lat, line)?;
                let (north, east) = parse_pair(lon, line)?;
                SeedPoint::new(south, west).with_extent(north, east)
            }
        };
        seeds.push(seed);
    }

    Ok(seeds)
}

fn parse_float(cell: &str, line: usize) -> CollectResult<f64> {
    cell.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            CollectError::InvalidConfig(format!("line {line}: '{cell}' is not a coordinate"))
        })
}

fn parse_pair(cell: &str, line: usize) -> CollectResult<(f64, f64)> {
    match cell.split_once(',') {
        Some((a, b)) => Ok((parse_float(a, line)?, parse_float(b, line)?)),
        None => Err(CollectError::InvalidConfig(format!(
            "line {line}: boundary mode expects a \"lat,lon\" pair, got '{cell}'"
        ))),
    }
}
