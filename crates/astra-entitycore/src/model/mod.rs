//! Loaded 3D models.

pub mod ojm;

pub use ojm::{Material, Ojm, OjmMesh, OjmVertex, Shape, ShapeDraw};
