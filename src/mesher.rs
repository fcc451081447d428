//! Isosurface extraction from binary lung masks.
//!
//! Runs marching cubes over the mask treated as a scalar field (selected = 1,
//! unselected = 0) at the halfway isovalue. A sampling stride trades surface
//! detail for triangle count: a step of `k` samples every `k`-th voxel along
//! each axis. Vertices on edges shared between neighbouring cells are emitted
//! once and referenced by index, so the result is a single connected mesh
//! rather than disjoint per-cell fragments.

use crate::mc_tables::TRIANGLE_TABLE;
use crate::segmenter::LungMask;

use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

/// Isovalue separating selected from unselected voxels.
const ISO_LEVEL: f32 = 0.5;

/// Corner `i` of a cell sits at the cell origin plus this offset, in sample
/// units. The corner order matches the configuration bit order expected by
/// [`TRIANGLE_TABLE`].
const CORNER_OFFSETS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

/// Corner pairs spanned by the 12 cell edges: edges 0-3 run along x,
/// 4-7 along y, 8-11 along z.
const CELL_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (2, 3),
    (4, 5),
    (6, 7),
    (0, 2),
    (1, 3),
    (4, 6),
    (5, 7),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("sampling step must be a positive number of voxels, got {0}")]
    InvalidStep(usize),
}

/// Triangle mesh in voxel-index space, `(x, y, z) = (column, row, slice)`.
///
/// Every face is a triple of indices into `vertices` with a consistent
/// winding, so face normals can be derived from the cross product of the
/// edge vectors. Rescaling to physical units is left to the caller (see
/// [`crate::export::to_physical`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceMesh {
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
}

impl SurfaceMesh {
    pub fn triangle_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Extract the surface of the selected region as a triangle mesh.
///
/// `step` is the sampling stride in voxels along every axis. A mask with no
/// selected voxels, or one too small to hold a single cell at the requested
/// stride, yields an empty mesh.
///
/// # Errors
///
/// Returns [`MeshError::InvalidStep`] if `step` is zero, before any
/// processing happens.
pub fn extract_isosurface(mask: &LungMask, step: usize) -> Result<SurfaceMesh, MeshError> {
    if step == 0 {
        return Err(MeshError::InvalidStep(step));
    }

    let (depth, rows, cols) = mask.dim();
    let samples = |extent: usize| if extent == 0 { 0 } else { (extent - 1) / step + 1 };
    let (samples_x, samples_y, samples_z) = (samples(cols), samples(rows), samples(depth));

    let mut mesh = SurfaceMesh::default();
    if samples_x < 2 || samples_y < 2 || samples_z < 2 {
        return Ok(mesh);
    }

    // Signed sample: negative inside the mask, so the selected region is the
    // interior of the extracted surface.
    let data = mask.data();
    let signed = |x: usize, y: usize, z: usize| -> f32 {
        if data[[z * step, y * step, x * step]] {
            ISO_LEVEL - 1.0
        } else {
            ISO_LEVEL
        }
    };

    // Vertex index per crossed edge, keyed by the edge's origin sample and
    // axis. Shared between all cells touching the edge.
    let mut edge_vertices: HashMap<(usize, usize, usize, usize), u32> = HashMap::new();
    let mut corner_values = [0.0_f32; 8];

    for z in 0..samples_z - 1 {
        for y in 0..samples_y - 1 {
            for x in 0..samples_x - 1 {
                let mut config = 0usize;
                for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
                    let value = signed(x + offset[0], y + offset[1], z + offset[2]);
                    corner_values[i] = value;
                    if value < 0.0 {
                        config |= 1 << i;
                    }
                }
                if config == 0 || config == 255 {
                    continue;
                }

                let entry = TRIANGLE_TABLE[config];
                let triangle_count = (entry & 0xF) as usize;
                let mut packed = entry >> 4;
                for _ in 0..triangle_count {
                    let mut triangle = [0u32; 3];
                    for slot in &mut triangle {
                        let edge = (packed & 0xF) as usize;
                        packed >>= 4;
                        *slot = edge_vertex(
                            edge,
                            (x, y, z),
                            &corner_values,
                            step,
                            &mut edge_vertices,
                            &mut mesh.vertices,
                        );
                    }
                    mesh.faces.push(triangle);
                }
            }
        }
    }

    info!(
        step,
        vertices = mesh.vertices.len(),
        triangles = mesh.faces.len(),
        "extracted isosurface"
    );
    Ok(mesh)
}

/// Get or create the vertex where the surface crosses `edge` of the cell at
/// `cell`, returning its index. The crossing point is linearly interpolated
/// between the edge's corner values and placed in voxel-index space.
fn edge_vertex(
    edge: usize,
    cell: (usize, usize, usize),
    corner_values: &[f32; 8],
    step: usize,
    edge_vertices: &mut HashMap<(usize, usize, usize, usize), u32>,
    vertices: &mut Vec<[f32; 3]>,
) -> u32 {
    let (corner_a, corner_b) = CELL_EDGES[edge];
    let axis = edge / 4;
    let origin = CORNER_OFFSETS[corner_a];
    let key = (
        cell.0 + origin[0],
        cell.1 + origin[1],
        cell.2 + origin[2],
        axis,
    );

    if let Some(&index) = edge_vertices.get(&key) {
        return index;
    }

    let value_a = corner_values[corner_a];
    let value_b = corner_values[corner_b];
    let t = value_a / (value_a - value_b);

    let mut position = [key.0 as f32, key.1 as f32, key.2 as f32];
    position[axis] += t;
    let scale = step as f32;
    let vertex = [
        position[0] * scale,
        position[1] * scale,
        position[2] * scale,
    ];

    let index = vertices.len() as u32;
    edge_vertices.insert(key, index);
    vertices.push(vertex);
    index
}
