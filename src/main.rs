use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lung_volume::{
    enums::Orientation, export, mesher, segmenter, volume_loader::VolumeLoader,
};

/// Segment the lungs in a CT scan and export the surface for inspection.
#[derive(Parser)]
#[command(name = "lung-volume")]
struct Args {
    /// DICOM directory or MetaImage (.mhd) header file
    scan_path: PathBuf,

    /// Sampling stride in voxels for surface extraction
    #[arg(short, long, default_value_t = 2)]
    step: usize,

    /// Directory for the extracted mesh and slice previews
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let volume = VolumeLoader::load(&args.scan_path)
        .with_context(|| format!("failed to load scan from {}", args.scan_path.display()))?;

    let mask = segmenter::segment(&volume);
    mask.ensure_matches(&volume)?;

    let mesh = mesher::extract_isosurface(&mask, args.step)?;
    let mesh = export::to_physical(&mesh, &volume);

    fs::create_dir_all(&args.output)?;
    let mesh_path = args.output.join("lungs.obj");
    export::write_obj(&mesh, &mesh_path)
        .with_context(|| format!("failed to write {}", mesh_path.display()))?;

    let (depth, rows, cols) = volume.dim();
    for (orientation, name, index) in [
        (Orientation::Axial, "axial", depth / 2),
        (Orientation::Coronal, "coronal", rows / 2),
        (Orientation::Sagittal, "sagittal", cols / 2),
    ] {
        if let Some(image) = volume.get_image_from_axis(index, orientation) {
            image.save(args.output.join(format!("{name}.png")))?;
        }
    }

    info!(
        voxels = mask.selected_voxels(),
        triangles = mesh.triangle_count(),
        output = %args.output.display(),
        "wrote lung surface and slice previews"
    );
    Ok(())
}
