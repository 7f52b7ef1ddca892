//! Read-only zone table, built once before dispatch begins.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ZoneError;
use crate::types::{Point, ZoneId};

/// Rectangular area a fire can be reported in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
}

impl Zone {
    pub fn new(id: ZoneId, start: Point, end: Point) -> Self {
        Self {
            id,
            start_x: start.x,
            start_y: start.y,
            end_x: end.x,
            end_y: end.y,
        }
    }

    /// Midpoint of the rectangle; units fly here to drop agent.
    pub fn centroid(&self) -> Point {
        Point::new(
            (self.start_x + self.end_x) / 2.0,
            (self.start_y + self.end_y) / 2.0,
        )
    }

    /// Compare bounds only, ignoring ids.
    pub fn same_bounds(&self, other: &Zone) -> bool {
        self.start_x == other.start_x
            && self.start_y == other.start_y
            && self.end_x == other.end_x
            && self.end_y == other.end_y
    }
}

/// Id to zone lookup shared by the dispatcher and every unit.
#[derive(Clone, Debug, Default)]
pub struct ZoneTable {
    zones: HashMap<ZoneId, Zone>,
}

impl ZoneTable {
    /// Build a table from zones, rejecting duplicate ids.
    pub fn from_zones(zones: impl IntoIterator<Item = Zone>) -> Result<Self, ZoneError> {
        let mut table = HashMap::new();
        for zone in zones {
            if table.insert(zone.id, zone).is_some() {
                return Err(ZoneError::Duplicate(zone.id));
            }
        }
        Ok(Self { zones: table })
    }

    /// Parse `id,(x;y),(x;y)` lines. Blank lines and a leading header
    /// row whose first field is not numeric are skipped.
    pub fn parse(content: &str) -> Result<Self, ZoneError> {
        let mut zones = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                return Err(ZoneError::Parse {
                    line,
                    reason: format!("expected 3 fields, found {}", parts.len()),
                });
            }
            let id = match parts[0].parse::<ZoneId>() {
                Ok(id) => id,
                Err(_) if line == 1 => continue,
                Err(_) => {
                    return Err(ZoneError::Parse {
                        line,
                        reason: format!("invalid zone id {:?}", parts[0]),
                    });
                }
            };
            let start = parse_point(parts[1], line)?;
            let end = parse_point(parts[2], line)?;
            zones.push(Zone::new(id, start, end));
        }
        Self::from_zones(zones)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ZoneError> {
        let content = std::fs::read_to_string(path).map_err(|source| ZoneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn lookup(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(&id)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

fn parse_point(field: &str, line: usize) -> Result<Point, ZoneError> {
    let inner = field.trim_start_matches('(').trim_end_matches(')');
    let mut coords = inner.split(';').map(str::trim);
    let (Some(x), Some(y), None) = (coords.next(), coords.next(), coords.next()) else {
        return Err(ZoneError::Parse {
            line,
            reason: format!("expected (x;y), found {field:?}"),
        });
    };
    let parse = |value: &str| {
        value.parse::<f64>().map_err(|_| ZoneError::Parse {
            line,
            reason: format!("invalid coordinate {value:?}"),
        })
    };
    Ok(Point::new(parse(x)?, parse(y)?))
}
