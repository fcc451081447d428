//! Post-processing and export of extracted surfaces.
//!
//! The mesher emits vertices in voxel-index space; consumers that want
//! physical units rescale and recentre here before handing the mesh to a
//! viewer or writing it to disk for inspection.

use crate::mesher::SurfaceMesh;
use crate::volume::Volume;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Rescale a mesh from voxel-index space to millimetres, centred on the
/// volume midpoint. Vertex axes map as `(x, y, z) = (column, row, slice)`.
pub fn to_physical(mesh: &SurfaceMesh, volume: &Volume) -> SurfaceMesh {
    let (depth, rows, cols) = volume.dim();
    let (depth_mm, row_mm, col_mm) = volume.spacing();
    let center = [
        cols as f32 / 2.0,
        rows as f32 / 2.0,
        depth as f32 / 2.0,
    ];
    let scale = [col_mm, row_mm, depth_mm];

    let vertices = mesh
        .vertices
        .iter()
        .map(|vertex| {
            [
                (vertex[0] - center[0]) * scale[0],
                (vertex[1] - center[1]) * scale[1],
                (vertex[2] - center[2]) * scale[2],
            ]
        })
        .collect();

    SurfaceMesh {
        vertices,
        faces: mesh.faces.clone(),
    }
}

/// Write a mesh as a Wavefront OBJ file. Face indices are converted to the
/// 1-based convention of the format.
pub fn write_obj(mesh: &SurfaceMesh, path: impl AsRef<Path>) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for vertex in &mesh.vertices {
        writeln!(writer, "v {} {} {}", vertex[0], vertex[1], vertex[2])?;
    }
    for face in &mesh.faces {
        writeln!(writer, "f {} {} {}", face[0] + 1, face[1] + 1, face[2] + 1)?;
    }
    writer.flush()
}
