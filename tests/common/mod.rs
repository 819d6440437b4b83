//! Fixtures shared by the integration suites
//!
//! Scans are written as small solid-colour tiles so expected pixel values can
//! be computed by hand, and the pool is built from the real plugin crates.

#![allow(dead_code)]

use format_conversion::plugin::FormatConversionFactory;
use format_conversion::ConversionConfig;
use image::{DynamicImage, ImageBuffer, Rgb};
use micrograph_common::image_io::{load_image, save_image_atomic};
use micrograph_common::ImageFormat;
use micrograph_exposure_fusion::plugin::ExposureFusionFactory;
use micrograph_exposure_fusion::ExposureFusionConfig;
use micrograph_flat_field::plugin::FlatFieldFactory;
use micrograph_flat_field::FlatFieldConfig;
use micrograph_focus_stack::plugin::FocusStackFactory;
use micrograph_focus_stack::FocusStackConfig;
use micrograph_pipeline_core::{PipelineConfig, Registry, WorkerPool};
use micrograph_sharpen::plugin::SharpenFactory;
use micrograph_sharpen::SharpenConfig;
use micrograph_stabilization::plugin::StabilizationFactory;
use micrograph_stabilization::StabilizationConfig;
use std::path::Path;
use std::sync::Arc;

pub const TILE_SIZE: u32 = 8;

/// Worker pool and the scratch directory it hands to plugins
pub struct Pool {
    pub pool: WorkerPool,
    _scratch: tempfile::TempDir,
}

/// Registry holding every built-in plugin; flat-field only with a calibration image
pub fn registry(flat_field: Option<&Path>) -> Registry {
    let mut registry = Registry::new();
    registry
        .register(Arc::new(
            ExposureFusionFactory::new(ExposureFusionConfig::default()).unwrap(),
        ))
        .unwrap();
    registry
        .register(Arc::new(
            FocusStackFactory::new(FocusStackConfig::default()).unwrap(),
        ))
        .unwrap();
    registry
        .register(Arc::new(StabilizationFactory::new(
            StabilizationConfig::default(),
        )))
        .unwrap();
    registry
        .register(Arc::new(SharpenFactory::new(SharpenConfig::default()).unwrap()))
        .unwrap();
    registry
        .register(Arc::new(
            FormatConversionFactory::new(ConversionConfig::default()).unwrap(),
        ))
        .unwrap();
    if let Some(calibration) = flat_field {
        let config = FlatFieldConfig::new(calibration);
        registry
            .register(Arc::new(FlatFieldFactory::new(&config).unwrap()))
            .unwrap();
    }
    registry
}

/// Route pipeline logs through the test harness; safe to call from every test
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn pool(flat_field: Option<&Path>) -> Pool {
    init_logging();
    let scratch = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(Arc::new(registry(flat_field)), Some(3), scratch.path()).unwrap();
    Pool {
        pool,
        _scratch: scratch,
    }
}

/// Defaults with the upload hand-off turned off
pub fn no_upload() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.upload.enabled = false;
    config
}

pub fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([value; 3])))
}

pub fn write_image(dir: &Path, name: &str, image: &DynamicImage) {
    let format = ImageFormat::of_path(Path::new(name)).unwrap_or_default();
    save_image_atomic(image, &dir.join(name), format).unwrap();
}

pub fn write_tile(dir: &Path, name: &str, value: u8) {
    write_image(dir, name, &solid(TILE_SIZE, TILE_SIZE, value));
}

/// `cols x rows` cells with `depths` focus heights each; depth `z` has value `10 * (z + 1)`
pub fn write_stack_scan(dir: &Path, cols: u32, rows: u32, depths: u32) {
    for col in 0..cols {
        for row in 0..rows {
            for z in 0..depths {
                write_tile(
                    dir,
                    &format!("c{col:03}_r{row:03}_z{z:02}.tif"),
                    (10 * (z + 1)) as u8,
                );
            }
        }
    }
}

/// Centre pixel of the image at `path`
pub fn centre_pixel(path: &Path) -> [u8; 3] {
    let image = load_image(path).unwrap().to_rgb8();
    image
        .get_pixel(image.width() / 2, image.height() / 2)
        .0
}

/// Sorted file names directly inside `dir`, hidden files included
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            entry
                .file_type()
                .unwrap()
                .is_file()
                .then(|| entry.file_name().to_string_lossy().into_owned())
        })
        .collect();
    names.sort();
    names
}
