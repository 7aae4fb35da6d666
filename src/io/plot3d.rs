//! Plot3D multiblock ASCII mesh export and import.
//!
//! Structured meshes write as `.xyz` files: the block count, then
//! `ni nj nk` per block (`nk` is always 1 here), then per block the
//! whole plane of x values, then y, then z. The reader loads such
//! files back into [`StructuredMesh`] blocks.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use crate::{march::StructuredMesh, Vec3};

/// Error in Plot3D export or import.
#[derive(Debug, thiserror::Error)]
pub enum Plot3dError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A token was not a number.
    #[error("bad plot3d token '{0}'")]
    BadToken(String),
    /// The input ended before all announced data was read.
    #[error("plot3d input ended early while reading {0}")]
    Truncated(&'static str),
    /// A block had more than one k plane.
    #[error("block {block} has nk = {nk}, only nk = 1 is supported")]
    UnsupportedBlock {
        /// 0-based block index.
        block: usize,
        /// The offending plane count.
        nk: usize,
    },
    /// A block's dimensions were zero.
    #[error("block {block} has empty dimensions {ni} x {nj}")]
    EmptyBlock {
        /// 0-based block index.
        block: usize,
        /// Nodes per layer.
        ni: usize,
        /// Layer count.
        nj: usize,
    },
    /// A block announced more nodes than the input could hold.
    #[error("block {block} announces {ni} x {nj} nodes, more than the input holds")]
    OversizedBlock {
        /// 0-based block index.
        block: usize,
        /// Nodes per layer.
        ni: usize,
        /// Layer count.
        nj: usize,
    },
}

/// Write meshes as one multiblock file.
pub fn write_meshes<W: Write>(mut out: W, meshes: &[&StructuredMesh]) -> Result<(), Plot3dError> {
    writeln!(out, "{}", meshes.len())?;
    for mesh in meshes {
        writeln!(out, "{} {} 1", mesh.nodes_per_layer(), mesh.layer_count())?;
    }
    for mesh in meshes {
        for axis in 0..3 {
            write_plane(&mut out, mesh.points(), axis)?;
        }
    }
    Ok(())
}

/// Write meshes to the file at `path`.
pub fn save_meshes(path: impl AsRef<Path>, meshes: &[&StructuredMesh]) -> Result<(), Plot3dError> {
    let mut buf = Vec::new();
    write_meshes(&mut buf, meshes)?;
    fs::write(path, buf)?;
    Ok(())
}

// four values per line, the layout most plot3d tooling expects
fn write_plane<W: Write>(out: &mut W, points: &[Vec3], axis: usize) -> Result<(), Plot3dError> {
    for (k, p) in points.iter().enumerate() {
        if k > 0 {
            if k % 4 == 0 {
                writeln!(out)?;
            } else {
                write!(out, " ")?;
            }
        }
        write!(out, "{:.16E}", p[axis])?;
    }
    writeln!(out)?;
    Ok(())
}

/// Read a multiblock file from `path`.
pub fn load_meshes(path: impl AsRef<Path>) -> Result<Vec<StructuredMesh>, Plot3dError> {
    parse_meshes(&fs::read_to_string(path)?)
}

/// Parse multiblock text. Blocks are named `block_00`, `block_01`, ...
pub fn parse_meshes(text: &str) -> Result<Vec<StructuredMesh>, Plot3dError> {
    let mut tokens = text.split_whitespace();
    let nblocks: usize = parse_num(next_token(&mut tokens, "block count")?)?;

    // a hostile block count must not drive the allocation; the loop
    // runs out of tokens long before a clamped capacity hurts
    let mut dims = Vec::with_capacity(nblocks.min(text.len()));
    for block in 0..nblocks {
        let ni: usize = parse_num(next_token(&mut tokens, "block dimensions")?)?;
        let nj: usize = parse_num(next_token(&mut tokens, "block dimensions")?)?;
        let nk: usize = parse_num(next_token(&mut tokens, "block dimensions")?)?;
        if nk != 1 {
            return Err(Plot3dError::UnsupportedBlock { block, nk });
        }
        if ni == 0 || nj == 0 {
            return Err(Plot3dError::EmptyBlock { block, ni, nj });
        }
        // every node needs three coordinate tokens of at least one
        // byte, so the byte count bounds any honest block size
        let fits = ni
            .checked_mul(nj)
            .and_then(|c| c.checked_mul(3))
            .map_or(false, |c| c <= text.len());
        if !fits {
            return Err(Plot3dError::OversizedBlock { block, ni, nj });
        }
        dims.push((ni, nj));
    }

    let mut meshes = Vec::with_capacity(nblocks);
    for (block, &(ni, nj)) in dims.iter().enumerate() {
        let count = ni * nj;
        let mut coords = vec![[0.0_f64; 3]; count];
        for axis in 0..3 {
            for c in coords.iter_mut() {
                c[axis] = parse_num(next_token(&mut tokens, "coordinates")?)?;
            }
        }
        let points: Vec<Vec3> = coords.iter().map(|c| Vec3::new(c[0], c[1], c[2])).collect();
        let mesh = StructuredMesh::from_rows(format!("block_{block:02}"), ni, points)
            .map_err(|_| Plot3dError::EmptyBlock { block, ni, nj })?;
        meshes.push(mesh);
    }
    Ok(meshes)
}

fn next_token<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    what: &'static str,
) -> Result<&'a str, Plot3dError> {
    tokens.next().ok_or(Plot3dError::Truncated(what))
}

fn parse_num<T: std::str::FromStr>(tok: &str) -> Result<T, Plot3dError> {
    tok.parse().map_err(|_| Plot3dError::BadToken(tok.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn patch(name: &str, cols: usize, rows: usize, dz: f64) -> StructuredMesh {
        let points = (0..rows * cols)
            .map(|k| {
                let r = (k / cols) as f64;
                let c = (k % cols) as f64;
                Vec3::new(0.3 * c, 0.2 * r, dz + 0.01 * k as f64)
            })
            .collect();
        StructuredMesh::from_rows(name, cols, points).unwrap()
    }

    /// Blocks round-trip with their dimensions and coordinates.
    #[test]
    fn meshes_round_trip() {
        let a = patch("a", 3, 2, 0.0);
        let b = patch("b", 2, 4, 1.5);
        let mut buf = Vec::new();
        write_meshes(&mut buf, &[&a, &b]).unwrap();
        let text = String::from_utf8(buf).unwrap();

        let read = parse_meshes(&text).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].name(), "block_00");
        assert_eq!(read[0].nodes_per_layer(), 3);
        assert_eq!(read[0].layer_count(), 2);
        assert_eq!(read[1].nodes_per_layer(), 2);
        assert_eq!(read[1].layer_count(), 4);
        for (orig, back) in [(&a, &read[0]), (&b, &read[1])] {
            for (p, q) in orig.points().iter().zip(back.points()) {
                assert_abs_diff_eq!(p, q, epsilon = 1e-14);
            }
        }
    }

    /// Multi-plane blocks and short files are rejected.
    #[test]
    fn bad_inputs_are_rejected() {
        assert!(matches!(
            parse_meshes("1\n2 2 3\n"),
            Err(Plot3dError::UnsupportedBlock { block: 0, nk: 3 })
        ));
        assert!(matches!(
            parse_meshes("1\n2 2 1\n0.0 0.0"),
            Err(Plot3dError::Truncated(_))
        ));
        assert!(matches!(
            parse_meshes("1\n2 x 1\n"),
            Err(Plot3dError::BadToken(_))
        ));
    }

    /// Dimensions that overflow or dwarf the input fail up front
    /// instead of allocating.
    #[test]
    fn oversized_blocks_are_rejected() {
        assert!(matches!(
            parse_meshes("1\n4294967296 4294967296 1\n"),
            Err(Plot3dError::OversizedBlock { block: 0, .. })
        ));
        assert!(matches!(
            parse_meshes("1\n100000 100000 1\n0.0"),
            Err(Plot3dError::OversizedBlock { .. })
        ));
        // a hostile block count runs out of tokens instead of allocating
        assert!(matches!(
            parse_meshes("9999999999999999999\n"),
            Err(Plot3dError::Truncated(_))
        ));
    }
}
