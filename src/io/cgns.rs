//! CGNS surface and curve exchange through the `hdf5` crate.
//!
//! CGNS files in their HDF5 flavor are a tree of groups, each carrying
//! fixed-width ASCII `name`/`label`/`type` attributes and holding its
//! payload in a dataset called `" data"` (leading space included).
//! This module walks that tree directly: bases (`CGNSBase_t`) contain
//! unstructured zones (`Zone_t`), which contain `GridCoordinates` and
//! `Elements_t` sections. Triangle (`TRI_3`) and quadrilateral
//! (`QUAD_4`) sections assemble into surfaces, bar (`BAR_2`) sections
//! chain into curves. Writing produces a single-zone file of the same
//! flavor.

use std::path::Path;

use hdf5::types::FixedAscii;
use itertools::izip;

use crate::{
    curve::{Curve, CurveError},
    mesh::{MeshBuildError, TriSurface},
    Vec3,
};

/// CGNS element type codes used here.
const BAR_2: i64 = 3;
const TRI_3: i64 = 5;
const QUAD_4: i64 = 7;

/// Error reading or writing a CGNS file.
#[derive(Debug, thiserror::Error)]
pub enum CgnsError {
    /// Underlying HDF5 failure.
    #[error(transparent)]
    Hdf5(#[from] hdf5::Error),
    /// An expected CGNS node was absent.
    #[error("missing CGNS node '{0}'")]
    MissingNode(String),
    /// Coordinate arrays disagree in length.
    #[error("coordinate arrays disagree: x has {x}, y has {y}, z has {z}")]
    CoordinateMismatch {
        /// Length of `CoordinateX`.
        x: usize,
        /// Length of `CoordinateY`.
        y: usize,
        /// Length of `CoordinateZ`.
        z: usize,
    },
    /// A section's connectivity length is not a multiple of its arity.
    #[error("section '{section}' holds {len} ids, not a multiple of {per}")]
    RaggedSection {
        /// Section node name.
        section: String,
        /// Connectivity length.
        len: usize,
        /// Vertex ids per element.
        per: usize,
    },
    /// A connectivity entry referenced a vertex that does not exist.
    #[error("section '{section}' references vertex {index} of {vertex_count}")]
    IndexOutOfRange {
        /// Section node name.
        section: String,
        /// The 1-based id found in the file.
        index: i64,
        /// Number of vertices in the zone.
        vertex_count: usize,
    },
    /// A name does not fit CGNS's fixed-width ASCII fields.
    #[error("name '{0}' does not fit a CGNS label")]
    BadName(String),
    /// Assembling a surface from the read sections failed.
    #[error(transparent)]
    Mesh(#[from] MeshBuildError),
    /// Chaining bar sections into curves failed.
    #[error(transparent)]
    Curve(#[from] CurveError),
}

/// One unstructured zone read from a CGNS file: shared vertices plus
/// the element sections that reference them (flat 0-based indices).
#[derive(Clone, Debug)]
pub struct CgnsZone {
    /// Zone name (the zone group's name).
    pub name: String,
    /// Vertex coordinates.
    pub vertices: Vec<Vec3>,
    /// Triangle sections: section name and 3 vertex ids per element.
    pub tri_sections: Vec<(String, Vec<usize>)>,
    /// Quadrilateral sections: 4 vertex ids per element.
    pub quad_sections: Vec<(String, Vec<usize>)>,
    /// Bar sections: 2 vertex ids per element.
    pub bar_sections: Vec<(String, Vec<usize>)>,
}

impl CgnsZone {
    /// Assemble a surface from the zone's triangle and quad sections,
    /// either all of them (`None`) or the named subset.
    pub fn surface(&self, sections: Option<&[&str]>) -> Result<TriSurface, CgnsError> {
        let keep = |name: &str| sections.map_or(true, |sel| sel.iter().any(|s| *s == name));
        let mut tris = Vec::new();
        let mut quads = Vec::new();
        for (name, conn) in &self.tri_sections {
            if keep(name) {
                tris.extend_from_slice(conn);
            }
        }
        for (name, conn) in &self.quad_sections {
            if keep(name) {
                quads.extend_from_slice(conn);
            }
        }
        Ok(TriSurface::build(self.name.clone(), self.vertices.clone(), tris, quads)?)
    }

    /// Chain the zone's bar sections into curves, either all sections
    /// (`None`) or the named subset. Each section chains on its own;
    /// a section of several disconnected pieces yields several curves.
    pub fn curves(&self, sections: Option<&[&str]>) -> Result<Vec<Curve>, CgnsError> {
        let keep = |name: &str| sections.map_or(true, |sel| sel.iter().any(|s| *s == name));
        let mut out = Vec::new();
        for (name, bars) in &self.bar_sections {
            if keep(name) {
                out.extend(Curve::from_bars(name.clone(), &self.vertices, bars)?);
            }
        }
        Ok(out)
    }
}

/// Read every unstructured zone of every base in a CGNS file.
pub fn load_zones(path: impl AsRef<Path>) -> Result<Vec<CgnsZone>, CgnsError> {
    let file = hdf5::File::open(path)?;
    let mut zones = Vec::new();
    for base_name in file.member_names()? {
        let Ok(base) = file.group(&base_name) else { continue };
        if node_label(&base)?.as_deref() != Some("CGNSBase_t") {
            continue;
        }
        for zone_name in base.member_names()? {
            let Ok(zone) = base.group(&zone_name) else { continue };
            if node_label(&zone)?.as_deref() != Some("Zone_t") {
                continue;
            }
            zones.push(read_zone(&zone, &zone_name)?);
        }
    }
    if zones.is_empty() {
        return Err(CgnsError::MissingNode("Zone_t".into()));
    }
    log::debug!("read {} CGNS zone(s)", zones.len());
    Ok(zones)
}

fn read_zone(zone: &hdf5::Group, name: &str) -> Result<CgnsZone, CgnsError> {
    let grid = zone
        .group("GridCoordinates")
        .map_err(|_| CgnsError::MissingNode(format!("{name}/GridCoordinates")))?;
    let x = node_data_f64(&grid, "CoordinateX")?;
    let y = node_data_f64(&grid, "CoordinateY")?;
    let z = node_data_f64(&grid, "CoordinateZ")?;
    if x.len() != y.len() || x.len() != z.len() {
        return Err(CgnsError::CoordinateMismatch { x: x.len(), y: y.len(), z: z.len() });
    }
    let vertices: Vec<Vec3> = izip!(&x, &y, &z).map(|(x, y, z)| Vec3::new(*x, *y, *z)).collect();

    let mut tri_sections = Vec::new();
    let mut quad_sections = Vec::new();
    let mut bar_sections = Vec::new();
    for child in zone.member_names()? {
        let Ok(section) = zone.group(&child) else { continue };
        if node_label(&section)?.as_deref() != Some("Elements_t") {
            continue;
        }
        let meta = data_i64(&section, &child)?;
        let etype = *meta
            .first()
            .ok_or_else(|| CgnsError::MissingNode(format!("{child}/ data")))?;
        let per = match etype {
            BAR_2 => 2,
            TRI_3 => 3,
            QUAD_4 => 4,
            other => {
                log::debug!("skipping section '{child}' with unsupported element type {other}");
                continue;
            }
        };
        let raw = node_data_i64(&section, "ElementConnectivity")?;
        if raw.len() % per != 0 {
            return Err(CgnsError::RaggedSection { section: child.clone(), len: raw.len(), per });
        }
        let conn = raw
            .iter()
            .map(|&id| {
                if id < 1 || id as usize > vertices.len() {
                    Err(CgnsError::IndexOutOfRange {
                        section: child.clone(),
                        index: id,
                        vertex_count: vertices.len(),
                    })
                } else {
                    Ok(id as usize - 1)
                }
            })
            .collect::<Result<Vec<usize>, CgnsError>>()?;
        match per {
            2 => bar_sections.push((child.clone(), conn)),
            3 => tri_sections.push((child.clone(), conn)),
            _ => quad_sections.push((child.clone(), conn)),
        }
    }
    Ok(CgnsZone {
        name: name.to_string(),
        vertices,
        tri_sections,
        quad_sections,
        bar_sections,
    })
}

/// Write a surface as a single-zone CGNS file with one `TRI_3` section.
pub fn save_surface(path: impl AsRef<Path>, surface: &TriSurface) -> Result<(), CgnsError> {
    let file = hdf5::File::create(path)?;
    annotate(&file, "HDF5 MotherNode", "Root Node of HDF5 File", "MT")?;

    let version = file.create_group("CGNSLibraryVersion")?;
    annotate(&version, "CGNSLibraryVersion", "CGNSLibraryVersion_t", "R4")?;
    write_data_f32(&version, &[3.3])?;

    let base = file.create_group("Base")?;
    annotate(&base, "Base", "CGNSBase_t", "I4")?;
    write_data_i32(&base, &[2, 3])?;

    let zone = base.create_group(surface.name())?;
    annotate(&zone, surface.name(), "Zone_t", "I4")?;
    write_data_i32(
        &zone,
        &[surface.vertex_count() as i32, surface.face_count() as i32, 0],
    )?;

    let zone_type = zone.create_group("ZoneType")?;
    annotate(&zone_type, "ZoneType", "ZoneType_t", "C1")?;
    write_data_u8(&zone_type, b"Unstructured")?;

    let grid = zone.create_group("GridCoordinates")?;
    annotate(&grid, "GridCoordinates", "GridCoordinates_t", "MT")?;
    for (node, axis) in [("CoordinateX", 0), ("CoordinateY", 1), ("CoordinateZ", 2)] {
        let coord = grid.create_group(node)?;
        annotate(&coord, node, "DataArray_t", "R8")?;
        let values: Vec<f64> = surface.vertices().iter().map(|p| p[axis]).collect();
        write_data_f64(&coord, &values)?;
    }

    let elements = zone.create_group("TriElements")?;
    annotate(&elements, "TriElements", "Elements_t", "I4")?;
    write_data_i32(&elements, &[TRI_3 as i32, 0])?;
    let range = elements.create_group("ElementRange")?;
    annotate(&range, "ElementRange", "IndexRange_t", "I4")?;
    write_data_i32(&range, &[1, surface.face_count() as i32])?;
    let conn = elements.create_group("ElementConnectivity")?;
    annotate(&conn, "ElementConnectivity", "DataArray_t", "I4")?;
    let flat: Vec<i32> = surface.tri_indices().iter().map(|&i| i as i32 + 1).collect();
    write_data_i32(&conn, &flat)?;
    Ok(())
}

/// The `label` attribute of a CGNS node, if it has one.
fn node_label(group: &hdf5::Group) -> Result<Option<String>, CgnsError> {
    if !group.attr_names()?.iter().any(|a| a == "label") {
        return Ok(None);
    }
    let label = group.attr("label")?.read_scalar::<FixedAscii<33>>()?;
    Ok(Some(label.as_str().trim_end_matches('\0').to_string()))
}

/// The `" data"` payload of a child node, as doubles.
fn node_data_f64(parent: &hdf5::Group, node: &str) -> Result<Vec<f64>, CgnsError> {
    let group = parent
        .group(node)
        .map_err(|_| CgnsError::MissingNode(node.to_string()))?;
    data_f64(&group, node)
}

/// The `" data"` payload of a child node, as integers.
fn node_data_i64(parent: &hdf5::Group, node: &str) -> Result<Vec<i64>, CgnsError> {
    let group = parent
        .group(node)
        .map_err(|_| CgnsError::MissingNode(node.to_string()))?;
    data_i64(&group, node)
}

fn data_f64(group: &hdf5::Group, name: &str) -> Result<Vec<f64>, CgnsError> {
    let dset = group
        .dataset(" data")
        .map_err(|_| CgnsError::MissingNode(format!("{name}/ data")))?;
    Ok(dset.read_raw::<f64>()?)
}

// CGNS integer payloads are usually I4, occasionally I8.
fn data_i64(group: &hdf5::Group, name: &str) -> Result<Vec<i64>, CgnsError> {
    let dset = group
        .dataset(" data")
        .map_err(|_| CgnsError::MissingNode(format!("{name}/ data")))?;
    match dset.read_raw::<i64>() {
        Ok(values) => Ok(values),
        Err(_) => Ok(dset.read_raw::<i32>()?.into_iter().map(i64::from).collect()),
    }
}

fn annotate(group: &hdf5::Group, name: &str, label: &str, dtype: &str) -> Result<(), CgnsError> {
    write_str_attr(group, "name", name)?;
    write_str_attr(group, "label", label)?;
    write_str_attr(group, "type", dtype)?;
    Ok(())
}

fn write_str_attr(group: &hdf5::Group, key: &str, value: &str) -> Result<(), CgnsError> {
    let ascii =
        FixedAscii::<33>::from_ascii(value).map_err(|_| CgnsError::BadName(value.to_string()))?;
    group.new_attr::<FixedAscii<33>>().create(key)?.write_scalar(&ascii)?;
    Ok(())
}

fn write_data_f64(group: &hdf5::Group, values: &[f64]) -> Result<(), CgnsError> {
    let dims = [values.len()];
    let dset = group.new_dataset::<f64>().no_chunk().shape(&dims[..]).create(" data")?;
    dset.write_raw(values)?;
    Ok(())
}

fn write_data_f32(group: &hdf5::Group, values: &[f32]) -> Result<(), CgnsError> {
    let dims = [values.len()];
    let dset = group.new_dataset::<f32>().no_chunk().shape(&dims[..]).create(" data")?;
    dset.write_raw(values)?;
    Ok(())
}

fn write_data_i32(group: &hdf5::Group, values: &[i32]) -> Result<(), CgnsError> {
    let dims = [values.len()];
    let dset = group.new_dataset::<i32>().no_chunk().shape(&dims[..]).create(" data")?;
    dset.write_raw(values)?;
    Ok(())
}

fn write_data_u8(group: &hdf5::Group, values: &[u8]) -> Result<(), CgnsError> {
    let dims = [values.len()];
    let dset = group.new_dataset::<u8>().no_chunk().shape(&dims[..]).create(" data")?;
    dset.write_raw(values)?;
    Ok(())
}
