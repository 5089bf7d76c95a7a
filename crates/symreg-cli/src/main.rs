use anyhow::{Context, Result};
use burn_ndarray::NdArray;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use symreg_core::Volume;
use symreg_io::{read_mask, read_volume, save_linear, save_matrix, write_volume, write_warp};
use symreg_registration::pipeline::{InputDims, PipelineResult};
use symreg_registration::{ConsoleProgressCallback, ProgressTracker};
use tracing::info;

mod args;
mod progress_bar;

use args::Cli;
use progress_bar::BarProgressCallback;

type Backend = NdArray<f32>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    run(&cli)
}

fn run(cli: &Cli) -> Result<()> {
    let im1 = read_volume(&cli.image1)?;
    let im2 = read_volume(&cli.image2)?;
    info!(
        "image1 {:?} x {}, image2 {:?} x {}",
        im1.volume.grid().shape(),
        im1.volume.components(),
        im2.volume.grid().shape(),
        im2.volume.components()
    );

    let config = cli.pipeline_config()?;
    let pipeline = config
        .validate(im1.dims, im2.dims)
        .context("Invalid registration options")?;

    let mask1 = cli.mask1.as_ref().map(|p| read_mask(p, im1.volume.grid())).transpose()?;
    let mask2 = cli.mask2.as_ref().map(|p| read_mask(p, im2.volume.grid())).transpose()?;

    let tracker = if cli.quiet {
        ProgressTracker::new().with_callback(Arc::new(ConsoleProgressCallback::default()))
    } else {
        ProgressTracker::new().with_callback(Arc::new(BarProgressCallback::new()))
    };
    let pipeline = pipeline.with_progress(tracker);
    if pipeline.reorienter().is_some() {
        info!("SH input detected, registering {} volumes with reorientation", pipeline.volumes());
    }

    let device = Default::default();
    let result = pipeline
        .run::<Backend>(&im1.volume, &im2.volume, mask1.as_ref(), mask2.as_ref(), &device)
        .context("Registration failed")?;

    save_outputs(cli, &result, im2.dims)
}

fn save_outputs(cli: &Cli, result: &PipelineResult, dims2: InputDims) -> Result<()> {
    if let (Some(path), Some(rigid)) = (&cli.rigid.output, &result.rigid) {
        save_linear(path, &rigid.transform)?;
        info!("Saved rigid transform to {}", path.display());
    }
    if let Some(affine) = &result.affine {
        if let Some(path) = &cli.affine.output {
            save_linear(path, &affine.transform)?;
            info!("Saved affine transform to {}", path.display());
        }
        if let Some(path) = &cli.affine.half {
            save_matrix(path, &affine.transform.half()?.transform())?;
        }
        if let Some(path) = &cli.affine.half_inverse {
            save_matrix(path, &affine.transform.half_inverse()?.transform())?;
        }
    }
    if let (Some(path), Some(syn)) = (&cli.syn.output, &result.syn) {
        write_warp(path, &syn.bundle)?;
    }
    if let (Some(path), Some(volume)) = (&cli.transformed, &result.transformed) {
        save_image(path, volume, dims2)?;
    }
    if let (Some(paths), Some((out1, out2))) = (&cli.transformed_midway, &result.transformed_midway) {
        save_image(&paths[0], out1, dims2)?;
        save_image(&paths[1], out2, dims2)?;
    }
    Ok(())
}

fn save_image(path: &Path, volume: &Volume, dims: InputDims) -> Result<()> {
    if dims.ndim == 4 && volume.components() < dims.volumes {
        tracing::warn!(
            "{}: only the {} registered volumes of {} are written",
            path.display(),
            volume.components(),
            dims.volumes
        );
    }
    write_volume(path, volume).with_context(|| format!("Failed to save {}", path.display()))?;
    info!("Saved {}", path.display());
    Ok(())
}
