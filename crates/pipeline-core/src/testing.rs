//! Mock plugins and fixtures shared by the unit tests

use crate::error::PluginError;
use crate::image_ref::{ImageRead, ImageWrite};
use crate::plugin::{check_arity, Arity, Plugin, PluginFactory};
use crate::registry::Registry;
use crate::Context;
use image::{DynamicImage, ImageBuffer, Rgb};
use micrograph_common::image_io::save_image_atomic;
use micrograph_common::ImageFormat;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock plugin: copies its middle input to the output
pub(crate) struct MockPlugin {
    name: &'static str,
    arity: Arity,
    runs: Arc<AtomicUsize>,
    fail_on: Arc<Mutex<Vec<String>>>,
}

impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn arity(&self) -> Arity {
        self.arity
    }

    fn run(
        &mut self,
        _ctx: &Context,
        inputs: &[ImageRead],
        output: &ImageWrite,
    ) -> Result<(), PluginError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        check_arity(self.arity, inputs)?;
        if self.fail_on.lock().unwrap().contains(&output.label()) {
            return Err(PluginError::ExecutionFailed(format!(
                "{} refused {}",
                self.name,
                output.label()
            )));
        }
        let img = inputs[inputs.len() / 2].load()?;
        output.store((*img).clone())?;
        Ok(())
    }
}

pub(crate) struct MockFactory {
    name: &'static str,
    arity: Arity,
    runs: Arc<AtomicUsize>,
    fail_on: Arc<Mutex<Vec<String>>>,
}

impl MockFactory {
    pub(crate) fn new(name: &'static str, arity: Arity) -> Arc<Self> {
        Arc::new(Self {
            name,
            arity,
            runs: Arc::new(AtomicUsize::new(0)),
            fail_on: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Make every task writing `file_name` fail
    pub(crate) fn fail_on(&self, file_name: &str) {
        self.fail_on.lock().unwrap().push(file_name.to_string());
    }
}

impl PluginFactory for MockFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Mock plugin"
    }

    fn arity(&self) -> Arity {
        self.arity
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(MockPlugin {
            name: self.name,
            arity: self.arity,
            runs: Arc::clone(&self.runs),
            fail_on: Arc::clone(&self.fail_on),
        })
    }
}

pub(crate) fn registry_with(factories: &[Arc<MockFactory>]) -> Arc<Registry> {
    let mut registry = Registry::new();
    for factory in factories {
        registry.register(Arc::clone(factory) as Arc<dyn PluginFactory>).unwrap();
    }
    Arc::new(registry)
}

pub(crate) fn solid(value: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(8, 8, Rgb([value; 3])))
}

pub(crate) fn write_tile(dir: &Path, name: &str, value: u8) {
    let format = ImageFormat::of_path(Path::new(name)).unwrap_or_default();
    save_image_atomic(&solid(value), &dir.join(name), format).unwrap();
}

/// A `cols x rows` grid with `depths` focus heights per cell; pixel value encodes the depth
pub(crate) fn write_stack_scan(dir: &Path, cols: u32, rows: u32, depths: u32) {
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
