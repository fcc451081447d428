use crate::volume::Volume;

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, s};
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Spacing values must be strictly positive, got {0:?}")]
    InvalidSpacing((f32, f32, f32)),

    #[error("Scan path is neither a DICOM directory nor a MetaImage header: {0}")]
    UnsupportedScanPath(std::path::PathBuf),

    #[error("MetaImage header error: {0}")]
    MetaImageHeader(String),

    #[error("Unsupported MetaImage element type: {0}")]
    UnsupportedElementType(String),

    #[error("MetaImage data size mismatch: expected {expected} bytes, found {found}")]
    MetaImageDataSize { expected: usize, found: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a scan from a path, picking the format from its shape: a
    /// directory is read as a DICOM series, a `.mhd` file as a MetaImage
    /// header with a detached raw data file.
    pub fn load(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        if path.is_dir() {
            return Self::load_from_directory(path);
        }
        let is_metaimage = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mhd"));
        if is_metaimage {
            return Self::load_from_metaimage(path);
        }
        Err(VolumeLoaderError::UnsupportedScanPath(path.to_path_buf()))
    }

    /// Load a volume from DICOM objects
    ///
    /// Slices are ordered by the z component of Image Position (Patient),
    /// falling back to Slice Location. Stored values are converted to
    /// Hounsfield units through the modality LUT.
    ///
    /// # Errors
    ///
    /// Returns error if no valid images are found, dimensions are
    /// inconsistent, or spacing information is missing or non-positive
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<Volume, VolumeLoaderError> {
        let mut images_with_position: Vec<_> = dicom_objects
            .iter()
            .filter_map(Self::extract_image_with_position)
            .collect();

        if images_with_position.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        images_with_position
            .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let positions: Vec<Option<f32>> = images_with_position
            .iter()
            .map(|(position, _)| *position)
            .collect();

        let images: Vec<_> = images_with_position
            .into_iter()
            .map(|(_, image)| image)
            .collect();

        Self::validate_dimensions(&images)?;

        let depth_spacing = Self::infer_depth_spacing(&positions, dicom_objects)
            .ok_or(VolumeLoaderError::MissingSpacing)?;
        let (row_spacing, column_spacing) =
            Self::get_pixel_spacing(dicom_objects).ok_or(VolumeLoaderError::MissingSpacing)?;
        let spacing = Self::validate_spacing((depth_spacing, row_spacing, column_spacing))?;

        let volume_array = Self::build_volume_array(&images);
        info!(
            dim = ?volume_array.dim(),
            ?spacing,
            "assembled volume from DICOM series"
        );

        Ok(Volume::new(volume_array, spacing))
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        debug!(slices = paths.len(), "reading DICOM series");

        let objects: Result<Vec<_>, _> = paths.iter().map(|path| open_file(path)).collect();

        Self::load_from_dicom_objects(&objects?)
    }

    /// Load a volume from a MetaImage (`.mhd`) header file
    ///
    /// Supports 3-D `MET_SHORT` images with a detached data file. MetaImage
    /// stores dimensions and spacing in `x y z` order; both are reversed
    /// into this crate's `(depth, rows, columns)` convention.
    pub fn load_from_metaimage(path: impl AsRef<Path>) -> Result<Volume, VolumeLoaderError> {
        let path = path.as_ref();
        let header = fs::read_to_string(path)?;

        let mut dim_size: Option<(usize, usize, usize)> = None;
        let mut spacing: Option<(f32, f32, f32)> = None;
        let mut element_type: Option<String> = None;
        let mut data_file: Option<String> = None;
        let mut big_endian = false;

        for line in header.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "NDims" => {
                    if value != "3" {
                        return Err(VolumeLoaderError::MetaImageHeader(format!(
                            "expected NDims = 3, got {value}"
                        )));
                    }
                }
                "DimSize" => {
                    let dims: Vec<usize> =
                        value.split_whitespace().filter_map(|v| v.parse().ok()).collect();
                    if dims.len() != 3 {
                        return Err(VolumeLoaderError::MetaImageHeader(format!(
                            "invalid DimSize: {value}"
                        )));
                    }
                    dim_size = Some((dims[0], dims[1], dims[2]));
                }
                "ElementSpacing" | "ElementSize" => {
                    let values: Vec<f32> =
                        value.split_whitespace().filter_map(|v| v.parse().ok()).collect();
                    if values.len() != 3 {
                        return Err(VolumeLoaderError::MetaImageHeader(format!(
                            "invalid {key}: {value}"
                        )));
                    }
                    // Keep ElementSpacing if both keys are present
                    if spacing.is_none() || key == "ElementSpacing" {
                        spacing = Some((values[0], values[1], values[2]));
                    }
                }
                "ElementType" => element_type = Some(value.to_string()),
                "ElementByteOrderMSB" | "BinaryDataByteOrderMSB" => {
                    big_endian = value.eq_ignore_ascii_case("true");
                }
                "CompressedData" => {
                    if value.eq_ignore_ascii_case("true") {
                        return Err(VolumeLoaderError::MetaImageHeader(
                            "compressed data is not supported".to_string(),
                        ));
                    }
                }
                "ElementDataFile" => data_file = Some(value.to_string()),
                _ => {}
            }
        }

        let (nx, ny, nz) =
            dim_size.ok_or_else(|| VolumeLoaderError::MetaImageHeader("missing DimSize".into()))?;
        let (sx, sy, sz) = spacing
            .ok_or_else(|| VolumeLoaderError::MetaImageHeader("missing ElementSpacing".into()))?;
        match element_type.as_deref() {
            Some("MET_SHORT") => {}
            Some(other) => {
                return Err(VolumeLoaderError::UnsupportedElementType(other.to_string()));
            }
            None => {
                return Err(VolumeLoaderError::MetaImageHeader("missing ElementType".into()));
            }
        }
        let data_file = data_file
            .ok_or_else(|| VolumeLoaderError::MetaImageHeader("missing ElementDataFile".into()))?;
        if data_file == "LOCAL" {
            return Err(VolumeLoaderError::MetaImageHeader(
                "embedded (LOCAL) data is not supported".to_string(),
            ));
        }

        let data_path = path.parent().unwrap_or(Path::new(".")).join(&data_file);
        let raw = fs::read(&data_path)?;
        let expected = nx * ny * nz * size_of::<i16>();
        if raw.len() != expected {
            return Err(VolumeLoaderError::MetaImageDataSize {
                expected,
                found: raw.len(),
            });
        }

        let values: Vec<i16> = raw
            .chunks_exact(2)
            .map(|bytes| {
                let bytes = [bytes[0], bytes[1]];
                if big_endian {
                    i16::from_be_bytes(bytes)
                } else {
                    i16::from_le_bytes(bytes)
                }
            })
            .collect();

        // MetaImage raw data varies x fastest, so (nz, ny, nx) matches the
        // row-major layout directly.
        let data = Array3::from_shape_vec((nz, ny, nx), values)
            .map_err(|e| VolumeLoaderError::MetaImageHeader(e.to_string()))?;
        let spacing = Self::validate_spacing((sz, sy, sx))?;
        info!(dim = ?data.dim(), ?spacing, "assembled volume from MetaImage");

        Ok(Volume::new(data, spacing))
    }

    fn validate_spacing(spacing: (f32, f32, f32)) -> Result<(f32, f32, f32), VolumeLoaderError> {
        let (d, r, c) = spacing;
        if d <= 0.0 || r <= 0.0 || c <= 0.0 || !d.is_finite() || !r.is_finite() || !c.is_finite() {
            return Err(VolumeLoaderError::InvalidSpacing(spacing));
        }
        Ok(spacing)
    }

    fn extract_image_with_position(
        dicom_object: &FileDicomObject<InMemDicomObject>,
    ) -> Option<(Option<f32>, Array2<i16>)> {
        let position = Self::get_slice_position(dicom_object);
        let image_2d = Self::decode_image(dicom_object)?;
        Some((position, image_2d))
    }

    fn get_slice_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<f32> {
        if let Ok(element) = dicom_object.element(tags::IMAGE_POSITION_PATIENT)
            && let Ok(position) = element.to_multi_float32()
            && let Some(z) = position.get(2)
        {
            return Some(*z);
        }
        dicom_object
            .element(tags::SLICE_LOCATION)
            .ok()?
            .to_float32()
            .ok()
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<i16>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::Default);
        pixel_data
            .to_ndarray_with_options::<i16>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn validate_dimensions(images: &[Array2<i16>]) -> Result<(), VolumeLoaderError> {
        let first_dim = images[0].dim();
        if images.iter().any(|img| img.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(images: &[Array2<i16>]) -> Array3<i16> {
        let (height, width) = images[0].dim();
        let depth = images.len();
        let mut volume = Array3::<i16>::zeros((depth, height, width));

        for (i, image) in images.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(image);
        }

        volume
    }

    /// Depth spacing from the gap between consecutive sorted slice
    /// positions, falling back to the Slice Thickness attribute.
    fn infer_depth_spacing(
        positions: &[Option<f32>],
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Option<f32> {
        let from_positions = positions.windows(2).find_map(|pair| match pair {
            [Some(a), Some(b)] if (b - a).abs() > 0.0 => Some((b - a).abs()),
            _ => None,
        });
        if from_positions.is_some() {
            return from_positions;
        }

        dicom_objects.iter().find_map(|dicom_object| {
            dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float32()
                .ok()
        })
    }

    fn get_pixel_spacing(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Option<(f32, f32)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float32()
                .ok()?;
            Some((*pixel_spacing.first()?, *pixel_spacing.get(1)?))
        })
    }
}
