//! Tecplot ASCII export and import.
//!
//! Curves write as `FELineSeg` zones, surfaces as `FETriangle` zones,
//! and structured meshes as ordered `I x J` zones, all with point
//! packing. The reader picks the line-segment zones out of a file and
//! chains them back into curves, so curve files round-trip up to float
//! formatting; other zone kinds are skipped over.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use crate::{curve::Curve, curve::CurveError, march::StructuredMesh, mesh::TriSurface, Vec3};

/// Error in Tecplot export or import.
#[derive(Debug, thiserror::Error)]
pub enum TecplotError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A zone header or data line did not parse.
    #[error("malformed tecplot input at line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        reason: String,
    },
    /// Chaining the read bars into curves failed.
    #[error(transparent)]
    Curve(#[from] CurveError),
}

/// Write curves as `FELineSeg` zones, one zone per curve.
/// Closed curves include their wrap-around segment, so the reader
/// recovers the closed flag.
pub fn write_curves<W: Write>(mut out: W, curves: &[&Curve]) -> Result<(), TecplotError> {
    writeln!(out, "TITLE = \"tsurf curves\"")?;
    writeln!(out, "VARIABLES = \"X\" \"Y\" \"Z\"")?;
    for curve in curves {
        let nodes = curve.node_count();
        let elements = curve.segment_count();
        writeln!(out, "ZONE T=\"{}\"", curve.name())?;
        writeln!(out, "Nodes={nodes}, Elements={elements}, ZONETYPE=FELineSeg")?;
        writeln!(out, "DATAPACKING=POINT")?;
        for p in curve.points() {
            writeln!(out, "{:.16E} {:.16E} {:.16E}", p.x, p.y, p.z)?;
        }
        for seg in 0..elements {
            let (i, j) = curve.segment(seg);
            writeln!(out, "{} {}", i + 1, j + 1)?;
        }
    }
    Ok(())
}

/// Write curves to the file at `path`.
pub fn save_curves(path: impl AsRef<Path>, curves: &[&Curve]) -> Result<(), TecplotError> {
    let mut buf = Vec::new();
    write_curves(&mut buf, curves)?;
    fs::write(path, buf)?;
    Ok(())
}

/// Write a surface as one `FETriangle` zone.
pub fn write_surface<W: Write>(mut out: W, surface: &TriSurface) -> Result<(), TecplotError> {
    writeln!(out, "TITLE = \"tsurf surface\"")?;
    writeln!(out, "VARIABLES = \"X\" \"Y\" \"Z\"")?;
    writeln!(out, "ZONE T=\"{}\"", surface.name())?;
    writeln!(
        out,
        "Nodes={}, Elements={}, ZONETYPE=FETriangle",
        surface.vertex_count(),
        surface.face_count()
    )?;
    writeln!(out, "DATAPACKING=POINT")?;
    for p in surface.vertices() {
        writeln!(out, "{:.16E} {:.16E} {:.16E}", p.x, p.y, p.z)?;
    }
    for face in 0..surface.face_count() {
        let [a, b, c] = surface.face(face);
        writeln!(out, "{} {} {}", a + 1, b + 1, c + 1)?;
    }
    Ok(())
}

/// Write a surface to the file at `path`.
pub fn save_surface(path: impl AsRef<Path>, surface: &TriSurface) -> Result<(), TecplotError> {
    let mut buf = Vec::new();
    write_surface(&mut buf, surface)?;
    fs::write(path, buf)?;
    Ok(())
}

/// Write a structured mesh as one ordered zone (`K = 1`).
pub fn write_structured<W: Write>(mut out: W, mesh: &StructuredMesh) -> Result<(), TecplotError> {
    writeln!(out, "TITLE = \"tsurf mesh\"")?;
    writeln!(out, "VARIABLES = \"X\" \"Y\" \"Z\"")?;
    writeln!(
        out,
        "ZONE T=\"{}\", I={}, J={}, K=1",
        mesh.name(),
        mesh.nodes_per_layer(),
        mesh.layer_count()
    )?;
    writeln!(out, "DATAPACKING=POINT")?;
    for p in mesh.points() {
        writeln!(out, "{:.16E} {:.16E} {:.16E}", p.x, p.y, p.z)?;
    }
    Ok(())
}

/// Write a structured mesh to the file at `path`.
pub fn save_structured(path: impl AsRef<Path>, mesh: &StructuredMesh) -> Result<(), TecplotError> {
    let mut buf = Vec::new();
    write_structured(&mut buf, mesh)?;
    fs::write(path, buf)?;
    Ok(())
}

/// Read every `FELineSeg` zone of a Tecplot ASCII file as curves.
pub fn load_curves(path: impl AsRef<Path>) -> Result<Vec<Curve>, TecplotError> {
    parse_curves(&fs::read_to_string(path)?)
}

/// Parse every `FELineSeg` zone of Tecplot ASCII text as curves.
///
/// Triangle and ordered zones are recognized and skipped. A zone's
/// bars are chained into ordered polylines; a zone that chains into
/// several pieces yields several curves named from the zone title.
pub fn parse_curves(text: &str) -> Result<Vec<Curve>, TecplotError> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
        .collect();

    let mut curves = Vec::new();
    let mut pos = 0;
    while pos < lines.len() {
        let (lineno, line) = lines[pos];
        if !line.to_ascii_uppercase().starts_with("ZONE") {
            pos += 1;
            continue;
        }
        // zone headers may span lines; every header line carries '='
        let mut header = line.to_string();
        pos += 1;
        while pos < lines.len()
            && lines[pos].1.contains('=')
            && !lines[pos].1.to_ascii_uppercase().starts_with("ZONE")
        {
            header.push(' ');
            header.push_str(lines[pos].1);
            pos += 1;
        }
        if let Some(packing) = header_value(&header, "DATAPACKING") {
            if !packing.eq_ignore_ascii_case("POINT") {
                return Err(TecplotError::Malformed {
                    line: lineno,
                    reason: format!("unsupported DATAPACKING '{packing}'"),
                });
            }
        }
        let name = zone_name(&header).unwrap_or_else(|| format!("zone_{:02}", curves.len()));

        // ordered zones carry I/J/K and no connectivity
        if let Some(iv) = header_value(&header, "I") {
            let ni = parse_count(iv, lineno, "I")?;
            let nj = match header_value(&header, "J") {
                Some(v) => parse_count(v, lineno, "J")?,
                None => 1,
            };
            let nk = match header_value(&header, "K") {
                Some(v) => parse_count(v, lineno, "K")?,
                None => 1,
            };
            let count = ni
                .checked_mul(nj)
                .and_then(|c| c.checked_mul(nk))
                .ok_or_else(|| TecplotError::Malformed {
                    line: lineno,
                    reason: "zone dimensions overflow".into(),
                })?;
            pos = pos.saturating_add(count).min(lines.len());
            continue;
        }

        let nodes = match header_value(&header, "Nodes") {
            Some(v) => parse_count(v, lineno, "Nodes")?,
            None => {
                return Err(TecplotError::Malformed {
                    line: lineno,
                    reason: "zone header lacks a Nodes count".into(),
                })
            }
        };
        let elements = match header_value(&header, "Elements") {
            Some(v) => parse_count(v, lineno, "Elements")?,
            None => {
                return Err(TecplotError::Malformed {
                    line: lineno,
                    reason: "zone header lacks an Elements count".into(),
                })
            }
        };
        let available = lines.len() - pos;
        if nodes > available || elements > available - nodes {
            return Err(TecplotError::Malformed {
                line: lineno,
                reason: "zone data truncated".into(),
            });
        }
        let zonetype = header_value(&header, "ZONETYPE")
            .map(str::to_ascii_uppercase)
            .unwrap_or_default();
        if zonetype != "FELINESEG" {
            pos += nodes + elements;
            continue;
        }

        let mut points = Vec::with_capacity(nodes);
        for k in 0..nodes {
            let (ln, l) = lines[pos + k];
            points.push(parse_point(l, ln)?);
        }
        pos += nodes;
        let mut bars = Vec::with_capacity(2 * elements);
        for k in 0..elements {
            let (ln, l) = lines[pos + k];
            let mut it = l.split_whitespace();
            for _ in 0..2 {
                let tok = it.next().ok_or_else(|| TecplotError::Malformed {
                    line: ln,
                    reason: "bar element needs two node ids".into(),
                })?;
                let id: usize = tok.parse().map_err(|_| TecplotError::Malformed {
                    line: ln,
                    reason: format!("bad node id '{tok}'"),
                })?;
                if id == 0 || id > nodes {
                    return Err(TecplotError::Malformed {
                        line: ln,
                        reason: format!("node id {id} out of range 1..={nodes}"),
                    });
                }
                bars.push(id - 1);
            }
        }
        pos += elements;
        curves.extend(Curve::from_bars(name, &points, &bars)?);
    }
    Ok(curves)
}

/// Value of a `key=value` token in a zone header, comma or space
/// separated, case-insensitive. Quoted titles are handled separately.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|tok| tok.split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn zone_name(header: &str) -> Option<String> {
    let start = header.find("T=\"").or_else(|| header.find("t=\""))? + 3;
    let rest = &header[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn parse_count(value: &str, line: usize, key: &str) -> Result<usize, TecplotError> {
    value.trim().parse().map_err(|_| TecplotError::Malformed {
        line,
        reason: format!("bad {key} value '{value}'"),
    })
}

fn parse_point(line: &str, lineno: usize) -> Result<Vec3, TecplotError> {
    let mut it = line.split_whitespace();
    let mut xyz = [0.0; 3];
    for slot in &mut xyz {
        let tok = it.next().ok_or_else(|| TecplotError::Malformed {
            line: lineno,
            reason: "point needs three coordinates".into(),
        })?;
        *slot = tok.parse().map_err(|_| TecplotError::Malformed {
            line: lineno,
            reason: format!("bad coordinate '{tok}'"),
        })?;
    }
    Ok(Vec3::new(xyz[0], xyz[1], xyz[2]))
}
