//! Image references: plugin operands that hide whether an image lives on disk or in memory
//!
//! An [`ImageRead`] wraps either a file or a decoded image. Plugins that need a
//! real path (anything that shells out) call [`ImageRead::path`]; an in-memory
//! image is then written once to a temporary file owned by the reference and
//! deleted when the reference is dropped.
//!
//! An [`ImageWrite`] describes where a result goes: a fixed path, a fresh path
//! from a [`ScratchAllocator`], or memory. Path targets are written atomically.

use micrograph_common::image_io::{
    image_dimensions, load_image, partial_path, save_image_atomic, save_image_with_quality,
    DEFAULT_JPEG_QUALITY,
};
use micrograph_common::{ImageFormat, ProcessingError, Result};
use image::{DynamicImage, GenericImageView};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempPath;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hands out unique file names inside one scratch directory
#[derive(Debug)]
pub struct ScratchAllocator {
    dir: PathBuf,
    counter: AtomicU64,
}

impl ScratchAllocator {
    /// Allocate inside `dir`, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A path that no earlier call on this allocator returned
    pub fn next_path(&self, format: ImageFormat) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("scratch-{n:06}.{}", format.extension()))
    }
}

#[derive(Debug)]
enum ReadSource {
    File(PathBuf),
    Memory(Arc<DynamicImage>),
}

/// A plugin input
#[derive(Debug)]
pub struct ImageRead {
    source: ReadSource,
    materialized: Mutex<Option<TempPath>>,
}

impl ImageRead {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ReadSource::File(path.into()),
            materialized: Mutex::new(None),
        }
    }

    pub fn from_image(img: impl Into<Arc<DynamicImage>>) -> Self {
        Self {
            source: ReadSource::Memory(img.into()),
            materialized: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        matches!(self.source, ReadSource::Memory(_))
    }

    /// The on-disk source, if this reference was created from a path
    #[must_use]
    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            ReadSource::File(path) => Some(path),
            ReadSource::Memory(_) => None,
        }
    }

    /// Decode the image (a cheap handle clone for in-memory sources)
    pub fn load(&self) -> Result<Arc<DynamicImage>> {
        match &self.source {
            ReadSource::File(path) => Ok(Arc::new(load_image(path)?)),
            ReadSource::Memory(img) => Ok(Arc::clone(img)),
        }
    }

    /// Width and height without decoding pixel data when possible
    pub fn dimensions(&self) -> Result<(u32, u32)> {
        match &self.source {
            ReadSource::File(path) => image_dimensions(path),
            ReadSource::Memory(img) => Ok(img.dimensions()),
        }
    }

    /// A readable file holding this image
    ///
    /// In-memory images are written to a lossless temporary inside `scratch_dir`
    /// the first time this is called; later calls return the same file.
    pub fn path(&self, scratch_dir: &Path) -> Result<PathBuf> {
        let img = match &self.source {
            ReadSource::File(path) => return Ok(path.clone()),
            ReadSource::Memory(img) => img,
        };

        let mut materialized = lock(&self.materialized);
        if let Some(existing) = materialized.as_ref() {
            return Ok(existing.to_path_buf());
        }

        fs::create_dir_all(scratch_dir)?;
        let temp = tempfile::Builder::new()
            .prefix("read-")
            .suffix(".tif")
            .tempfile_in(scratch_dir)?
            .into_temp_path();
        save_image_atomic(img, &temp, ImageFormat::Tif)?;
        debug!("Materialized in-memory input at {}", temp.display());

        let path = temp.to_path_buf();
        *materialized = Some(temp);
        Ok(path)
    }

    /// Short description for logs
    #[must_use]
    pub fn label(&self) -> String {
        match &self.source {
            ReadSource::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            ReadSource::Memory(_) => "<memory>".to_string(),
        }
    }
}

#[derive(Debug)]
enum WriteTarget {
    File { path: PathBuf, format: ImageFormat },
    Memory,
}

/// A plugin output slot
#[derive(Debug)]
pub struct ImageWrite {
    target: WriteTarget,
    stored: Mutex<Option<DynamicImage>>,
    external: Mutex<Option<TempPath>>,
}

impl ImageWrite {
    /// Write to a fixed path; the format follows the extension (TIFF when unknown)
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = ImageFormat::of_path(&path).unwrap_or_default();
        Self::new(WriteTarget::File { path, format })
    }

    /// Keep the result in memory for the caller to [`take`](Self::take)
    pub fn in_memory() -> Self {
        Self::new(WriteTarget::Memory)
    }

    /// Write to a fresh file from `allocator`
    pub fn scratch(allocator: &ScratchAllocator, format: ImageFormat) -> Self {
        Self::new(WriteTarget::File {
            path: allocator.next_path(format),
            format,
        })
    }

    fn new(target: WriteTarget) -> Self {
        Self {
            target,
            stored: Mutex::new(None),
            external: Mutex::new(None),
        }
    }

    /// Destination path, `None` for memory targets
    #[must_use]
    pub fn target_path(&self) -> Option<&Path> {
        match &self.target {
            WriteTarget::File { path, .. } => Some(path),
            WriteTarget::Memory => None,
        }
    }

    /// Format of the destination file, `None` for memory targets
    #[must_use]
    pub fn format(&self) -> Option<ImageFormat> {
        match &self.target {
            WriteTarget::File { format, .. } => Some(*format),
            WriteTarget::Memory => None,
        }
    }

    /// Store the result
    pub fn store(&self, img: DynamicImage) -> Result<()> {
        self.store_with_quality(img, DEFAULT_JPEG_QUALITY)
    }

    /// Store the result using an explicit JPEG quality for JPEG targets
    pub fn store_with_quality(&self, img: DynamicImage, jpeg_quality: u8) -> Result<()> {
        match &self.target {
            WriteTarget::File { path, format } => {
                save_image_with_quality(&img, path, *format, jpeg_quality)
            }
            WriteTarget::Memory => {
                *lock(&self.stored) = Some(img);
                Ok(())
            }
        }
    }

    /// A path an external program may write the result to
    ///
    /// Must be followed by [`finish_external`](Self::finish_external) once the
    /// program has exited successfully. For file targets this is a hidden
    /// sibling of the destination, so a failing tool leaves no partial output.
    pub fn external_path(&self, scratch_dir: &Path) -> Result<PathBuf> {
        match &self.target {
            WriteTarget::File { path, .. } => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                Ok(partial_path(path))
            }
            WriteTarget::Memory => {
                fs::create_dir_all(scratch_dir)?;
                let temp = tempfile::Builder::new()
                    .prefix("write-")
                    .suffix(".tif")
                    .tempfile_in(scratch_dir)?
                    .into_temp_path();
                let path = temp.to_path_buf();
                *lock(&self.external) = Some(temp);
                Ok(path)
            }
        }
    }

    /// Adopt the file an external program wrote at `written`
    pub fn finish_external(&self, written: &Path) -> Result<()> {
        if !written.exists() {
            return Err(ProcessingError::Other(format!(
                "External tool did not produce {}",
                written.display()
            )));
        }
        match &self.target {
            WriteTarget::File { path, .. } => {
                fs::rename(written, path)?;
                Ok(())
            }
            WriteTarget::Memory => {
                let img = load_image(written)?;
                // dropping the TempPath removes the file
                lock(&self.external).take();
                *lock(&self.stored) = Some(img);
                Ok(())
            }
        }
    }

    /// Whether a result is already present
    #[must_use]
    pub fn exists(&self) -> bool {
        match &self.target {
            WriteTarget::File { path, .. } => path.exists(),
            WriteTarget::Memory => lock(&self.stored).is_some(),
        }
    }

    /// Remove and return an in-memory result
    pub fn take(&self) -> Option<DynamicImage> {
        lock(&self.stored).take()
    }

    /// Short description for logs
    #[must_use]
    pub fn label(&self) -> String {
        match &self.target {
            WriteTarget::File { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            WriteTarget::Memory => "<memory>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([value; 3])))
    }

    #[test]
    fn test_scratch_paths_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = ScratchAllocator::new(dir.path().join("scratch")).unwrap();
        let a = alloc.next_path(ImageFormat::Tif);
        let b = alloc.next_path(ImageFormat::Tif);
        assert_ne!(a, b);
        assert!(a.starts_with(alloc.dir()));
    }

    #[test]
    fn test_allocators_do_not_share_state() {
        let dir = tempfile::tempdir().unwrap();
        let first = ScratchAllocator::new(dir.path().join("a")).unwrap();
        let second = ScratchAllocator::new(dir.path().join("b")).unwrap();
        first.next_path(ImageFormat::Jpg);
        assert_eq!(
            second.next_path(ImageFormat::Jpg).file_name(),
            Some(std::ffi::OsStr::new("scratch-000000.jpg"))
        );
    }

    #[test]
    fn test_memory_read_materializes_once_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let read = ImageRead::from_image(solid(4, 3, 9));

        let first = read.path(dir.path()).unwrap();
        let second = read.path(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(first.exists());
        assert_eq!(image_dimensions(&first).unwrap(), (4, 3));

        drop(read);
        assert!(!first.exists());
    }

    #[test]
    fn test_file_read_uses_source_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c000_r000.tif");
        save_image_atomic(&solid(5, 5, 1), &path, ImageFormat::Tif).unwrap();

        let read = ImageRead::from_path(&path);
        assert_eq!(read.path(dir.path()).unwrap(), path);
        assert_eq!(read.dimensions().unwrap(), (5, 5));
        assert_eq!(read.label(), "c000_r000.tif");
    }

    #[test]
    fn test_memory_write_round_trip() {
        let write = ImageWrite::in_memory();
        assert!(!write.exists());
        write.store(solid(2, 2, 7)).unwrap();
        assert!(write.exists());
        assert_eq!(write.take().unwrap().dimensions(), (2, 2));
        assert!(write.take().is_none());
    }

    #[test]
    fn test_path_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stacked").join("c000_r000.jpg");
        let write = ImageWrite::to_path(&target);
        assert_eq!(write.format(), Some(ImageFormat::Jpg));

        write.store(solid(3, 3, 200)).unwrap();
        assert!(write.exists());
        assert!(!partial_path(&target).exists());
    }

    #[test]
    fn test_external_write_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("c000_r000.tif");
        let write = ImageWrite::to_path(&target);

        let external = write.external_path(dir.path()).unwrap();
        assert_ne!(external, target);
        save_image_atomic(&solid(2, 2, 3), &external, ImageFormat::Tif).unwrap();
        write.finish_external(&external).unwrap();

        assert!(target.exists());
        assert!(!external.exists());
    }

    #[test]
    fn test_external_write_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let write = ImageWrite::in_memory();

        let external = write.external_path(dir.path()).unwrap();
        save_image_atomic(&solid(6, 2, 3), &external, ImageFormat::Tif).unwrap();
        write.finish_external(&external).unwrap();

        assert!(!external.exists());
        assert_eq!(write.take().unwrap().dimensions(), (6, 2));
    }

    #[test]
    fn test_finish_external_requires_output() {
        let dir = tempfile::tempdir().unwrap();
        let write = ImageWrite::to_path(dir.path().join("c000_r000.tif"));
        let external = write.external_path(dir.path()).unwrap();
        assert!(write.finish_external(&external).is_err());
        assert!(!write.exists());
    }
}
