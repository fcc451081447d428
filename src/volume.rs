use crate::enums::Orientation;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

/// Lower edge of the display window in Hounsfield units.
pub const DISPLAY_WINDOW_MIN_HU: i16 = -1000;
/// Upper edge of the display window in Hounsfield units.
pub const DISPLAY_WINDOW_MAX_HU: i16 = 400;

/// A calibrated CT volume.
///
/// Voxel intensities are stored in Hounsfield units (air ≈ -1000, water ≈ 0)
/// with axis order `(depth, rows, columns)`. Spacing is given in millimetres
/// per voxel along the same axes and is strictly positive (enforced by the
/// loaders in [`crate::volume_loader`]).
#[derive(Default)]
pub struct Volume {
    data: Array3<i16>,
    spacing: (f32, f32, f32),
}

impl Volume {
    pub fn new(data: Array3<i16>, spacing: (f32, f32, f32)) -> Self {
        Self { data, spacing }
    }

    /// Get the dimensions of the volume (depth, rows, columns)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<i16> {
        &self.data
    }

    /// Get the voxel spacing in millimetres (depth, row, column)
    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    #[inline]
    fn windowed_to_u8(value: i16) -> u8 {
        let span = f32::from(DISPLAY_WINDOW_MAX_HU) - f32::from(DISPLAY_WINDOW_MIN_HU);
        let t = (f32::from(value) - f32::from(DISPLAY_WINDOW_MIN_HU)) / span;
        (t * 255.0).clamp(0.0, 255.0) as u8
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, i16>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Render a slice as an 8-bit grayscale image using the fixed display
    /// window. Returns `None` if `index` is out of range along the axis.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        Self::slice_to_image(&slice)
    }

    fn slice_to_image(slice: &ArrayView2<'_, i16>) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::windowed_to_u8(v))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_volume() -> Volume {
        let data = Array3::from_shape_fn((4, 6, 8), |(d, r, c)| (d + r + c) as i16 - 1000);
        Volume::new(data, (2.5, 0.7, 0.7))
    }

    #[test]
    fn slice_dimensions_follow_orientation() {
        let volume = test_volume();
        let axial = volume.get_slice_from_axis(0, &Orientation::Axial).unwrap();
        assert_eq!(axial.dim(), (6, 8));
        let coronal = volume.get_slice_from_axis(0, &Orientation::Coronal).unwrap();
        assert_eq!(coronal.dim(), (4, 8));
        let sagittal = volume
            .get_slice_from_axis(0, &Orientation::Sagittal)
            .unwrap();
        assert_eq!(sagittal.dim(), (4, 6));
    }

    #[test]
    fn out_of_range_index_yields_none() {
        let volume = test_volume();
        assert!(volume.get_slice_from_axis(4, &Orientation::Axial).is_none());
        assert!(volume.get_image_from_axis(6, Orientation::Coronal).is_none());
    }

    #[test]
    fn window_clamps_to_display_range() {
        assert_eq!(Volume::windowed_to_u8(-2000), 0);
        assert_eq!(Volume::windowed_to_u8(DISPLAY_WINDOW_MIN_HU), 0);
        assert_eq!(Volume::windowed_to_u8(DISPLAY_WINDOW_MAX_HU), 255);
        assert_eq!(Volume::windowed_to_u8(3000), 255);
    }

    #[test]
    fn image_matches_slice_dimensions() {
        let volume = test_volume();
        let image = volume.get_image_from_axis(2, Orientation::Axial).unwrap();
        assert_eq!((image.width(), image.height()), (8, 6));
    }
}
