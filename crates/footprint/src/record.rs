//! The persisted row type and the mapping from OSM tags onto its columns.

use crate::element::Tags;
use serde::{Deserialize, Serialize};

/// Column order of the buildings table. Matches the field order of
/// [`PolygonRecord`], which is what the CSV writer serializes.
pub const COLUMNS: [&str; 11] = [
    "id",
    "coord",
    "name",
    "addr_country",
    "addr_city",
    "addr_street",
    "addr_housenumber",
    "building",
    "building_levels",
    "type",
    "geometry",
];

pub const COORD_COLUMN: &str = "coord";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolygonRecord {
    pub id: i64,
    /// Dedup key of the seed point whose query produced this row.
    pub coord: String,
    pub name: Option<String>,
    pub addr_country: Option<String>,
    pub addr_city: Option<String>,
    pub addr_street: Option<String>,
    pub addr_housenumber: Option<String>,
    pub building: Option<String>,
    pub building_levels: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// WKT polygon; `None` when the geometry could not be resolved.
    pub geometry: Option<String>,
}

impl PolygonRecord {
    /// Builds a record for element `id`, copying the tags that have a column.
    pub fn from_tags(id: i64, coord: &str, tags: &Tags) -> Self {
        let mut record = PolygonRecord {
            id,
            coord: coord.to_owned(),
            ..Default::default()
        };
        for (key, value) in tags {
            if let Some(slot) = record.tag_column(&flatten_key(key)) {
                *slot = Some(value.clone());
            }
        }
        record
    }

    /// The declared tag-to-column table. Tags not listed here are dropped.
    fn tag_column(&mut self, flat_key: &str) -> Option<&mut Option<String>> {
        match flat_key {
            "name" => Some(&mut self.name),
            "addr_country" => Some(&mut self.addr_country),
            "addr_city" => Some(&mut self.addr_city),
            "addr_street" => Some(&mut self.addr_street),
            "addr_housenumber" => Some(&mut self.addr_housenumber),
            "building" => Some(&mut self.building),
            "building_levels" => Some(&mut self.building_levels),
            "type" => Some(&mut self.kind),
            _ => None,
        }
    }
}

/// `tags.addr:street` -> `addr_street`.
pub fn flatten_key(key: &str) -> String {
    key.strip_prefix("tags.").unwrap_or(key).replace(':', "_")
}
