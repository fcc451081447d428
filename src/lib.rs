//! # Lung-volume library
//!
//! This crate segments the lung parenchyma of a CT scan and extracts its
//! surface as a triangle mesh for inspection and visual exploration.

//!
//! Scans are loaded either from a directory of DICOM slices (through the
//! dicom-rs ecosystem) or from a MetaImage (.mhd) header with a detached
//! raw data file, and converted to Hounsfield units. The pipeline is a pair
//! of pure in-memory transformations:
//!  - Segmentation: threshold at the air/tissue boundary, 6-connected
//!    component labelling, rejection of air connected to the volume
//!    boundary, selection of the two largest interior regions, hole
//!    filling and dilation
//!  - Surface extraction: marching cubes over the binary mask with a
//!    configurable sampling stride
//!
//!  The resulting mesh lives in voxel-index space; [`export`] rescales it
//!  to millimetres and writes Wavefront OBJ files, and [`volume::Volume`]
//!  renders windowed slice images for the three medical axes:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!
//!  Degenerate scans are results, not errors: a scan without interior air
//!  yields an empty mask, and an empty mask yields an empty mesh.
//!
//!  Contributions are highly welcome!
//!
//! # Examples
//!
//! ## Segmenting a scan and extracting the lung surface
//!
//! To read all DICOM files from the dicom/ directory, segment the lungs and
//! extract a mesh sampled every second voxel:
//!
//! ```no_run
//! # use lung_volume::{mesher, segmenter, volume_loader::VolumeLoader};
//! let volume = VolumeLoader::load("dicom").expect("should have loaded scan");
//! let mask = segmenter::segment(&volume);
//! let mesh = mesher::extract_isosurface(&mask, 2).expect("step is positive");
//! println!("{} triangles", mesh.triangle_count());
//! ```

pub mod enums;
pub mod export;
mod mc_tables;
pub mod mesher;
pub mod segmenter;
pub mod volume;
pub mod volume_loader;
