//! Lung parenchyma segmentation.
//!
//! Isolates the lung air regions of a calibrated CT volume as a binary mask:
//! threshold at the air/tissue boundary, label the candidate air voxels with
//! 6-connectivity, discard every component touching the volume boundary
//! (ambient air around the body and scanner bed), keep the two largest
//! interior components, then fill enclosed holes and dilate the result.
//!
//! The whole stage is a deterministic pure function; degenerate scans
//! (no air, or air only at the boundary) yield an all-false mask rather
//! than an error.

use crate::volume::Volume;

use ndarray::{Array3, Zip};
use thiserror::Error;
use tracing::{debug, info};

/// Air/tissue cutoff in Hounsfield units. Voxels below this value are
/// candidate air; the value follows the Kaggle DSB 2017 lung pipeline.
pub const AIR_THRESHOLD_HU: i16 = -320;

/// Largest enclosed cavity, in voxels, that hole filling will close.
/// Sized to absorb vessels and airways without swallowing genuine anatomy.
pub const MAX_HOLE_VOXELS: usize = 10_000;

/// Number of 6-neighbourhood dilation passes applied to the selected mask,
/// recovering parenchyma lost to the initial threshold.
pub const DILATION_PASSES: usize = 1;

/// How many interior air components to keep (left and right lung).
const LUNG_COMPONENT_COUNT: usize = 2;

#[derive(Debug, Error)]
#[error("mask shape {actual:?} does not match volume shape {expected:?}")]
pub struct ShapeMismatch {
    pub expected: (usize, usize, usize),
    pub actual: (usize, usize, usize),
}

/// Binary lung mask with the same shape as the volume it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LungMask {
    data: Array3<bool>,
}

impl LungMask {
    /// Get the dimensions of the mask (depth, rows, columns)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<bool> {
        &self.data
    }

    /// Number of selected voxels
    pub fn selected_voxels(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }

    /// Check the precondition that this mask was derived from `volume`.
    ///
    /// Passing a mask to a consumer together with a volume of a different
    /// shape is a contract violation, rejected here instead of producing
    /// garbage geometry downstream.
    pub fn ensure_matches(&self, volume: &Volume) -> Result<(), ShapeMismatch> {
        if self.dim() != volume.dim() {
            return Err(ShapeMismatch {
                expected: volume.dim(),
                actual: self.dim(),
            });
        }
        Ok(())
    }
}

/// Segment the lung air regions of a calibrated volume into a binary mask.
pub fn segment(volume: &Volume) -> LungMask {
    let dim = volume.dim();

    let mut air = Array3::from_elem(dim, false);
    Zip::from(&mut air)
        .and(volume.data())
        .par_for_each(|is_air, &hu| *is_air = hu < AIR_THRESHOLD_HU);

    let air_components = label_components(&air);
    debug!(
        components = air_components.count(),
        "labelled candidate air regions"
    );

    let lung_labels = select_lung_labels(&air_components);
    if lung_labels.is_empty() {
        info!("no interior air regions found, returning empty mask");
        return LungMask {
            data: Array3::from_elem(dim, false),
        };
    }

    let mut selected = Array3::from_elem(dim, false);
    for (voxel, &label) in selected.iter_mut().zip(&air_components.labels) {
        *voxel = label != 0 && lung_labels.contains(&label);
    }

    fill_holes(&mut selected);
    dilate(&mut selected, &air_components);

    let mask = LungMask { data: selected };
    info!(
        regions = lung_labels.len(),
        voxels = mask.selected_voxels(),
        "segmented lung mask"
    );
    mask
}

/// Connected components of a boolean grid under 6-connectivity.
///
/// `labels` parallels the grid in row-major order; 0 marks background.
/// `sizes` and `touches_border` are indexed by label, with slot 0 unused.
struct Components {
    labels: Vec<u32>,
    sizes: Vec<usize>,
    touches_border: Vec<bool>,
}

impl Components {
    fn count(&self) -> usize {
        self.sizes.len() - 1
    }

    fn is_border_label(&self, label: u32) -> bool {
        label != 0 && self.touches_border[label as usize]
    }
}

fn label_components(foreground: &Array3<bool>) -> Components {
    let (depth, rows, cols) = foreground.dim();
    let at = |d: usize, r: usize, c: usize| (d * rows + r) * cols + c;

    let mut labels = vec![0u32; depth * rows * cols];
    let mut sizes = vec![0usize];
    let mut touches_border = vec![false];
    let mut stack: Vec<(usize, usize, usize)> = Vec::new();

    for seed_d in 0..depth {
        for seed_r in 0..rows {
            for seed_c in 0..cols {
                if !foreground[[seed_d, seed_r, seed_c]] || labels[at(seed_d, seed_r, seed_c)] != 0
                {
                    continue;
                }
                let label = sizes.len() as u32;
                let mut size = 0usize;
                let mut border = false;

                labels[at(seed_d, seed_r, seed_c)] = label;
                stack.push((seed_d, seed_r, seed_c));
                while let Some((d, r, c)) = stack.pop() {
                    size += 1;
                    if d == 0
                        || r == 0
                        || c == 0
                        || d == depth - 1
                        || r == rows - 1
                        || c == cols - 1
                    {
                        border = true;
                    }

                    let mut visit = |nd: usize, nr: usize, nc: usize| {
                        if foreground[[nd, nr, nc]] && labels[at(nd, nr, nc)] == 0 {
                            labels[at(nd, nr, nc)] = label;
                            stack.push((nd, nr, nc));
                        }
                    };
                    if d > 0 {
                        visit(d - 1, r, c);
                    }
                    if d + 1 < depth {
                        visit(d + 1, r, c);
                    }
                    if r > 0 {
                        visit(d, r - 1, c);
                    }
                    if r + 1 < rows {
                        visit(d, r + 1, c);
                    }
                    if c > 0 {
                        visit(d, r, c - 1);
                    }
                    if c + 1 < cols {
                        visit(d, r, c + 1);
                    }
                }

                sizes.push(size);
                touches_border.push(border);
            }
        }
    }

    Components {
        labels,
        sizes,
        touches_border,
    }
}

/// Largest interior components first; ties broken by label order so the
/// selection is stable across runs.
fn select_lung_labels(components: &Components) -> Vec<u32> {
    let mut interior: Vec<(u32, usize)> = (1..=components.count() as u32)
        .filter(|&label| !components.touches_border[label as usize])
        .map(|label| (label, components.sizes[label as usize]))
        .collect();
    interior.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    interior.truncate(LUNG_COMPONENT_COUNT);
    interior.into_iter().map(|(label, _)| label).collect()
}

/// Fill enclosed cavities of the selected mask: complement components that
/// never reach the volume boundary, up to [`MAX_HOLE_VOXELS`]. The ambient
/// region always reaches the boundary, so it is never filled.
fn fill_holes(selected: &mut Array3<bool>) {
    let complement = selected.mapv(|v| !v);
    let holes = label_components(&complement);

    for (voxel, &label) in selected.iter_mut().zip(&holes.labels) {
        if label != 0
            && !holes.touches_border[label as usize]
            && holes.sizes[label as usize] <= MAX_HOLE_VOXELS
        {
            *voxel = true;
        }
    }
}

/// Grow the selected mask by one 6-neighbourhood shell per pass. Voxels that
/// belong to a border-connected air component are never claimed, keeping the
/// mask disconnected from the discarded ambient air.
fn dilate(selected: &mut Array3<bool>, air_components: &Components) {
    let (depth, rows, cols) = selected.dim();
    let at = |d: usize, r: usize, c: usize| (d * rows + r) * cols + c;

    for _ in 0..DILATION_PASSES {
        let mut additions: Vec<(usize, usize, usize)> = Vec::new();
        for d in 0..depth {
            for r in 0..rows {
                for c in 0..cols {
                    if selected[[d, r, c]] {
                        continue;
                    }
                    if air_components.is_border_label(air_components.labels[at(d, r, c)]) {
                        continue;
                    }
                    let touches_selection = (d > 0 && selected[[d - 1, r, c]])
                        || (d + 1 < depth && selected[[d + 1, r, c]])
                        || (r > 0 && selected[[d, r - 1, c]])
                        || (r + 1 < rows && selected[[d, r + 1, c]])
                        || (c > 0 && selected[[d, r, c - 1]])
                        || (c + 1 < cols && selected[[d, r, c + 1]]);
                    if touches_selection {
                        additions.push((d, r, c));
                    }
                }
            }
        }
        for (d, r, c) in additions {
            selected[[d, r, c]] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TISSUE_HU: i16 = 0;
    const AIR_HU: i16 = -1000;

    fn uniform_volume(dim: (usize, usize, usize), value: i16) -> Array3<i16> {
        Array3::from_elem(dim, value)
    }

    fn fill_box(
        data: &mut Array3<i16>,
        lo: (usize, usize, usize),
        hi: (usize, usize, usize),
        value: i16,
    ) {
        for d in lo.0..hi.0 {
            for r in lo.1..hi.1 {
                for c in lo.2..hi.2 {
                    data[[d, r, c]] = value;
                }
            }
        }
    }

    #[test]
    fn interior_cavity_is_selected_and_boundary_is_not() {
        let mut data = uniform_volume((20, 20, 20), TISSUE_HU);
        let center = 10.0_f32;
        let radius = 5.0_f32;
        for d in 0..20 {
            for r in 0..20 {
                for c in 0..20 {
                    let dist = ((d as f32 - center).powi(2)
                        + (r as f32 - center).powi(2)
                        + (c as f32 - center).powi(2))
                    .sqrt();
                    if dist < radius {
                        data[[d, r, c]] = AIR_HU;
                    }
                }
            }
        }
        let volume = Volume::new(data.clone(), (1.0, 1.0, 1.0));

        let mask = segment(&volume);

        // Every cavity voxel is selected, nothing on the bounding faces is,
        // and the mask never grows past the cavity's dilation shell.
        let is_air = |d: usize, r: usize, c: usize| data[[d, r, c]] == AIR_HU;
        for d in 0..20 {
            for r in 0..20 {
                for c in 0..20 {
                    if is_air(d, r, c) {
                        assert!(mask.data()[[d, r, c]], "cavity voxel ({d},{r},{c}) unselected");
                    }
                    let on_face = d == 0 || r == 0 || c == 0 || d == 19 || r == 19 || c == 19;
                    if on_face {
                        assert!(!mask.data()[[d, r, c]], "boundary voxel ({d},{r},{c}) selected");
                    }
                    if mask.data()[[d, r, c]] && !is_air(d, r, c) {
                        let next_to_cavity = (d > 0 && is_air(d - 1, r, c))
                            || (d < 19 && is_air(d + 1, r, c))
                            || (r > 0 && is_air(d, r - 1, c))
                            || (r < 19 && is_air(d, r + 1, c))
                            || (c > 0 && is_air(d, r, c - 1))
                            || (c < 19 && is_air(d, r, c + 1));
                        assert!(next_to_cavity, "voxel ({d},{r},{c}) outside the cavity shell");
                    }
                }
            }
        }
        assert!(mask.selected_voxels() > 0);
    }

    #[test]
    fn border_air_is_rejected_even_when_it_dominates() {
        // Entirely air except a tissue shell holding a small interior pocket.
        let mut data = uniform_volume((20, 20, 20), AIR_HU);
        fill_box(&mut data, (5, 5, 5), (15, 15, 15), TISSUE_HU);
        fill_box(&mut data, (7, 7, 7), (13, 13, 13), AIR_HU);
        let volume = Volume::new(data, (1.0, 1.0, 1.0));

        let mask = segment(&volume);

        // The vastly larger border-connected region stays unselected, down
        // to the voxels right next to the shell.
        for d in 0..20 {
            for r in 0..20 {
                for c in 0..20 {
                    let inside_shell = (5..15).contains(&d) && (5..15).contains(&r) && (5..15).contains(&c);
                    if !inside_shell {
                        assert!(!mask.data()[[d, r, c]], "outer voxel ({d},{r},{c}) selected");
                    }
                    let in_pocket = (7..13).contains(&d) && (7..13).contains(&r) && (7..13).contains(&c);
                    if in_pocket {
                        assert!(mask.data()[[d, r, c]], "pocket voxel ({d},{r},{c}) unselected");
                    }
                }
            }
        }
    }

    #[test]
    fn segmentation_is_deterministic() {
        let mut data = uniform_volume((16, 16, 16), AIR_HU);
        fill_box(&mut data, (3, 3, 3), (13, 13, 13), TISSUE_HU);
        fill_box(&mut data, (5, 5, 5), (11, 11, 11), AIR_HU);
        let volume = Volume::new(data, (1.0, 1.0, 1.0));

        let first = segment(&volume);
        let second = segment(&volume);
        assert_eq!(first, second);
    }

    #[test]
    fn all_tissue_volume_yields_all_false_mask() {
        let volume = Volume::new(uniform_volume((8, 8, 8), TISSUE_HU), (1.0, 1.0, 1.0));
        let mask = segment(&volume);
        assert_eq!(mask.dim(), (8, 8, 8));
        assert_eq!(mask.selected_voxels(), 0);
    }

    #[test]
    fn border_only_air_yields_all_false_mask() {
        let volume = Volume::new(uniform_volume((8, 8, 8), AIR_HU), (1.0, 1.0, 1.0));
        let mask = segment(&volume);
        assert_eq!(mask.selected_voxels(), 0);
    }

    #[test]
    fn small_enclosed_holes_are_filled() {
        // Tissue volume with an interior air cavity containing a floating
        // tissue blob (a vessel stand-in).
        let mut data = uniform_volume((20, 20, 20), TISSUE_HU);
        fill_box(&mut data, (6, 6, 6), (14, 14, 14), AIR_HU);
        fill_box(&mut data, (9, 9, 9), (11, 11, 11), TISSUE_HU);
        let volume = Volume::new(data, (1.0, 1.0, 1.0));

        let mask = segment(&volume);

        for d in 9..11 {
            for r in 9..11 {
                for c in 9..11 {
                    assert!(mask.data()[[d, r, c]], "hole voxel ({d},{r},{c}) not filled");
                }
            }
        }
    }

    #[test]
    fn oversized_enclosed_holes_are_left_open() {
        // A 22^3 blob (10648 voxels) exceeds MAX_HOLE_VOXELS and must not
        // be filled; only its dilated boundary shell may be claimed.
        let mut data = uniform_volume((28, 28, 28), TISSUE_HU);
        fill_box(&mut data, (2, 2, 2), (26, 26, 26), AIR_HU);
        fill_box(&mut data, (3, 3, 3), (25, 25, 25), TISSUE_HU);
        let volume = Volume::new(data, (1.0, 1.0, 1.0));

        let mask = segment(&volume);

        assert!(!mask.data()[[14, 14, 14]], "oversized hole was filled");
    }

    #[test]
    fn dilation_never_reclaims_border_air() {
        // One-voxel tissue wall between an enclosed pocket and ambient air:
        // dilation may claim the wall but never the ambient side.
        let mut data = uniform_volume((16, 16, 16), AIR_HU);
        fill_box(&mut data, (4, 4, 4), (12, 12, 12), TISSUE_HU);
        fill_box(&mut data, (5, 5, 5), (11, 11, 11), AIR_HU);
        let volume = Volume::new(data, (1.0, 1.0, 1.0));

        let mask = segment(&volume);

        for d in 0..16 {
            for r in 0..16 {
                for c in 0..16 {
                    let inside_shell = (4..12).contains(&d) && (4..12).contains(&r) && (4..12).contains(&c);
                    if !inside_shell {
                        assert!(
                            !mask.data()[[d, r, c]],
                            "ambient voxel ({d},{r},{c}) reconnected"
                        );
                    }
                }
            }
        }
        // The wall voxel next to the pocket was recovered by dilation.
        assert!(mask.data()[[4, 8, 8]]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let small = Volume::new(uniform_volume((4, 4, 4), TISSUE_HU), (1.0, 1.0, 1.0));
        let large = Volume::new(uniform_volume((5, 5, 5), TISSUE_HU), (1.0, 1.0, 1.0));

        let mask = segment(&small);
        assert!(mask.ensure_matches(&small).is_ok());

        let error = mask.ensure_matches(&large).unwrap_err();
        assert_eq!(error.expected, (5, 5, 5));
        assert_eq!(error.actual, (4, 4, 4));
    }
}
