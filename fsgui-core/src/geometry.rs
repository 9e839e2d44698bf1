use crate::error::ConfigurationError;
use std::collections::BTreeMap;

/// A polygon read out of a `<polygon settings>` block: a zone id and its
/// (x, y) vertex list.
#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    pub zone_id: i64,
    pub vertices: Vec<(f64, f64)>,
}

/// The parsed contents of a track geometry file. Unknown
/// sections are skipped; malformed known sections fail with a
/// descriptive `ConfigurationError`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackGeometry {
    pub zones: BTreeMap<i64, Polygon>,
    pub inclusion: BTreeMap<i64, Polygon>,
    pub exclusion: BTreeMap<i64, Polygon>,
}

const START_TAG: &str = "<Start settings>";
const END_TAG: &str = "<End settings>";
const POLY_TAG: &str = "<polygon settings>";

/// A cursor over non-blank lines, mirroring the original's
/// `BufferedReader` (`examples/original_source/fsgui/geometry.py`): each
/// `next()` call skips blank lines and returns `None` past end of input.
struct LineCursor<'a> {
    lines: Vec<&'a str>,
    index: usize,
    line_no: usize,
}

impl<'a> LineCursor<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.lines().collect(),
            index: 0,
            line_no: 0,
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        loop {
            if self.index >= self.lines.len() {
                return None;
            }
            let line = self.lines[self.index];
            self.index += 1;
            self.line_no += 1;
            if !line.trim().is_empty() {
                return Some(line.trim());
            }
        }
    }

    fn err(&self, message: impl Into<String>) -> ConfigurationError {
        ConfigurationError::InvalidParams {
            type_id: "track-geometry".to_string(),
            message: format!("line {}: {}", self.line_no, message.into()),
        }
    }
}

fn expect<'a>(cursor: &mut LineCursor<'a>, needle: &str) -> Result<&'a str, ConfigurationError> {
    match cursor.next() {
        Some(line) if line.contains(needle) => Ok(line),
        Some(line) => Err(cursor.err(format!("expected line containing {needle:?}, got {line:?}"))),
        None => Err(cursor.err(format!("expected line containing {needle:?}, got end of file"))),
    }
}

fn parse_floats(line: &str, prefix: &str) -> Result<Vec<f64>, ConfigurationError> {
    line.trim_start_matches(prefix)
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| ConfigurationError::InvalidParams {
                type_id: "track-geometry".to_string(),
                message: format!("expected float, got {tok:?}"),
            })
        })
        .collect()
}

fn parse_zone_id(line: &str) -> Result<i64, ConfigurationError> {
    line.split_whitespace()
        .nth(2)
        .and_then(|t| t.parse::<i64>().ok())
        .ok_or_else(|| ConfigurationError::InvalidParams {
            type_id: "track-geometry".to_string(),
            message: format!("could not parse zone id from {line:?}"),
        })
}

/// Read one `<Start settings>` ... `<End settings>` block of repeated
/// `<polygon settings>` entries into a `zone_id -> Polygon` map.
fn parse_polygon_block(
    cursor: &mut LineCursor,
    description: &str,
) -> Result<BTreeMap<i64, Polygon>, ConfigurationError> {
    expect(cursor, START_TAG)?;
    expect(cursor, description)?;

    let mut out = BTreeMap::new();
    loop {
        let line = cursor.next().ok_or_else(|| cursor.err("unexpected end of file in polygon block"))?;
        if line.contains(END_TAG) {
            break;
        }
        if !line.contains(POLY_TAG) {
            return Err(cursor.err(format!("expected {POLY_TAG:?} or {END_TAG:?}, got {line:?}")));
        }

        let zone_line = expect(cursor, "Zone id:")?;
        let zone_id = parse_zone_id(zone_line)?;
        let x_line = expect(cursor, "nodes_x:")?;
        let nodes_x = parse_floats(x_line, "nodes_x:")?;
        let y_line = expect(cursor, "nodes_y:")?;
        let nodes_y = parse_floats(y_line, "nodes_y:")?;

        if nodes_x.len() != nodes_y.len() {
            return Err(cursor.err("nodes_x and nodes_y have different lengths"));
        }

        out.insert(
            zone_id,
            Polygon {
                zone_id,
                vertices: nodes_x.into_iter().zip(nodes_y).collect(),
            },
        );
    }
    Ok(out)
}

/// Parse the full track geometry text format. Unrecognized sections are
/// skipped with a debug log; a recognised section with
/// malformed content fails with a line-numbered error.
pub fn parse(content: &str) -> Result<TrackGeometry, ConfigurationError> {
    let mut cursor = LineCursor::new(content);
    let mut geometry = TrackGeometry::default();

    while let Some(line) = cursor.next() {
        if line.contains("<Zone Objects>") {
            geometry.zones = parse_polygon_block(&mut cursor, "Description: Zone geometry")?;
        } else if line.contains("<Inclusion Zone Object>") {
            geometry.inclusion =
                parse_polygon_block(&mut cursor, "Description: Inclusion Zone geometry")?;
        } else if line.contains("<Exclusion Zone Objects>") {
            geometry.exclusion =
                parse_polygon_block(&mut cursor, "Description: Exclusion Zone geometry")?;
        } else if line.contains("<Linearization Object>") {
            // Linearization object content is opaque to the runtime core:
            // recognised so it doesn't fall through as unknown, but never
            // interpreted; skip its settings block without erroring.
            tracing::debug!("skipping Linearization Object section");
        } else {
            tracing::debug!(line, "skipping unknown track geometry section");
        }
    }

    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_zone_objects() {
        let content = "\
<Zone Objects>
<Start settings>
Description: Zone geometry
<polygon settings>
Zone id: 1
nodes_x: 0.0 10.0 10.0 0.0
nodes_y: 0.0 0.0 10.0 10.0
<End settings>
";
        let geometry = parse(content).unwrap();
        assert_eq!(geometry.zones.len(), 1);
        let poly = &geometry.zones[&1];
        assert_eq!(poly.vertices, vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
    }

    #[test]
    fn skips_unknown_sections() {
        let content = "\
<Some Unknown Object>
<Zone Objects>
<Start settings>
Description: Zone geometry
<polygon settings>
Zone id: 2
nodes_x: 1.0 2.0
nodes_y: 3.0 4.0
<End settings>
";
        let geometry = parse(content).unwrap();
        assert_eq!(geometry.zones.len(), 1);
        assert!(geometry.zones.contains_key(&2));
    }

    #[test]
    fn malformed_known_section_fails_descriptively() {
        let content = "\
<Zone Objects>
<Start settings>
Description: Zone geometry
<polygon settings>
Zone id: 1
nodes_x: 0.0 10.0
not_nodes_y: 0.0 10.0
<End settings>
";
        let err = parse(content).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nodes_y"));
    }
}
