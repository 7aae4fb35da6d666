//! File exchange: Tecplot ASCII zones, Plot3D multiblock meshes, and
//! (behind the `cgns` feature) CGNS-in-HDF5 surfaces and curves.

pub mod plot3d;
pub mod tecplot;

#[cfg(feature = "cgns")]
pub mod cgns;
