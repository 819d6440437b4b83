//! Scan indexing: turning a directory of tile files into a structured snapshot
//!
//! Tile files follow `c{col:03}_r{row:03}[_z{stack:02}][_h{hdr:02}][_is{frame:02}].{jpg|tif}`.
//! Every file in a scan directory must follow it; a stray name is an error
//! rather than a silently smaller index. Sentinel files, hidden files and
//! subdirectories (later pipeline stages live there) are not tiles.

use crate::error::ScanError;
use micrograph_common::ImageFormat;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Provenance sentinel written next to a finished pipeline
pub const PROCESSING_SENTINEL: &str = "processing.json";

/// Marker placed in the final output directory once it has been uploaded
pub const UPLOAD_MARKER: &str = "upload.json";

fn tile_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^c(\d{3})_r(\d{3})(?:_z(\d{2}))?(?:_h(\d{2}))?(?:_is(\d{2}))?\.(jpg|tif)$")
            .expect("tile pattern is a valid regex")
    })
}

/// An axis along which the variants of one grid cell differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Focus height (`_zNN`)
    Stack,
    /// Exposure (`_hNN`)
    Hdr,
    /// Repeated raw frame (`_isNN`)
    Stabilization,
}

impl Axis {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Axis::Stack => "stack",
            Axis::Hdr => "hdr",
            Axis::Stabilization => "stabilization",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One tile variant, as named on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileRef {
    pub col: u32,
    pub row: u32,
    pub stack: Option<u32>,
    pub hdr: Option<u32>,
    pub stabilization: Option<u32>,
}

impl TileRef {
    /// A tile with no optional axes
    #[must_use]
    pub fn cell(col: u32, row: u32) -> Self {
        Self {
            col,
            row,
            stack: None,
            hdr: None,
            stabilization: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: u32) -> Self {
        self.stack = Some(stack);
        self
    }

    #[must_use]
    pub fn with_hdr(mut self, hdr: u32) -> Self {
        self.hdr = Some(hdr);
        self
    }

    #[must_use]
    pub fn with_stabilization(mut self, frame: u32) -> Self {
        self.stabilization = Some(frame);
        self
    }

    /// Parse a file name; returns the tile and its on-disk format
    pub fn parse(file_name: &str) -> Result<(Self, ImageFormat), ScanError> {
        let caps = tile_pattern()
            .captures(file_name)
            .ok_or_else(|| ScanError::MalformedFilename(file_name.to_string()))?;

        let number = |i: usize| -> Option<u32> {
            caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok())
        };

        let (col, row) = match (number(1), number(2)) {
            (Some(col), Some(row)) => (col, row),
            _ => return Err(ScanError::MalformedFilename(file_name.to_string())),
        };
        let format = caps
            .get(6)
            .and_then(|m| ImageFormat::from_extension(m.as_str()))
            .ok_or_else(|| ScanError::MalformedFilename(file_name.to_string()))?;

        Ok((
            Self {
                col,
                row,
                stack: number(3),
                hdr: number(4),
                stabilization: number(5),
            },
            format,
        ))
    }

    /// Value of one optional axis
    #[must_use]
    pub fn axis(&self, axis: Axis) -> Option<u32> {
        match axis {
            Axis::Stack => self.stack,
            Axis::Hdr => self.hdr,
            Axis::Stabilization => self.stabilization,
        }
    }

    /// This tile with one axis removed: the key shared by everything fused together
    #[must_use]
    pub fn without(mut self, axis: Axis) -> Self {
        match axis {
            Axis::Stack => self.stack = None,
            Axis::Hdr => self.hdr = None,
            Axis::Stabilization => self.stabilization = None,
        }
        self
    }

    /// Grid cell of this tile
    #[must_use]
    pub fn coordinate(&self) -> (u32, u32) {
        (self.col, self.row)
    }

    /// Which optional axes are present, used for the homogeneity check
    fn axes_present(&self) -> (bool, bool, bool) {
        (
            self.stack.is_some(),
            self.hdr.is_some(),
            self.stabilization.is_some(),
        )
    }

    /// File name without extension, e.g. `c001_r002_z01`
    #[must_use]
    pub fn file_stem(&self) -> String {
        let mut stem = format!("c{:03}_r{:03}", self.col, self.row);
        if let Some(z) = self.stack {
            stem.push_str(&format!("_z{z:02}"));
        }
        if let Some(h) = self.hdr {
            stem.push_str(&format!("_h{h:02}"));
        }
        if let Some(f) = self.stabilization {
            stem.push_str(&format!("_is{f:02}"));
        }
        stem
    }

    #[must_use]
    pub fn file_name(&self, format: ImageFormat) -> String {
        format!("{}.{}", self.file_stem(), format.extension())
    }
}

impl fmt::Display for TileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// Grid dimensions plus the cardinality of every variant axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanShape {
    pub cols: u32,
    pub rows: u32,
    pub hdr_count: u32,
    pub stack_count: u32,
    pub stabilization_count: u32,
}

impl ScanShape {
    /// Number of variants along an axis (0 when the scan does not vary in it)
    #[must_use]
    pub fn count(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Stack => self.stack_count,
            Axis::Hdr => self.hdr_count,
            Axis::Stabilization => self.stabilization_count,
        }
    }

    /// Every cell holds exactly one image
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.hdr_count == 0 && self.stack_count == 0 && self.stabilization_count == 0
    }

    /// The shape left after fusing away `axis`
    #[must_use]
    pub fn without(mut self, axis: Axis) -> Self {
        match axis {
            Axis::Stack => self.stack_count = 0,
            Axis::Hdr => self.hdr_count = 0,
            Axis::Stabilization => self.stabilization_count = 0,
        }
        self
    }
}

/// A tile as found in an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTile {
    pub tile: TileRef,
    pub format: ImageFormat,
    pub path: PathBuf,
}

/// Immutable snapshot of one scan directory
#[derive(Debug, Clone)]
pub struct ScanIndex {
    directory: PathBuf,
    images: BTreeMap<String, IndexedTile>,
    grid: BTreeMap<(u32, u32), Vec<String>>,
    shape: ScanShape,
}

impl ScanIndex {
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// All tiles keyed by file name
    #[must_use]
    pub fn images(&self) -> &BTreeMap<String, IndexedTile> {
        &self.images
    }

    /// File names grouped by grid cell
    #[must_use]
    pub fn grid(&self) -> &BTreeMap<(u32, u32), Vec<String>> {
        &self.grid
    }

    #[must_use]
    pub fn shape(&self) -> ScanShape {
        self.shape
    }

    #[must_use]
    pub fn cols(&self) -> u32 {
        self.shape.cols
    }

    #[must_use]
    pub fn rows(&self) -> u32 {
        self.shape.rows
    }

    #[must_use]
    pub fn hdr_count(&self) -> u32 {
        self.shape.hdr_count
    }

    #[must_use]
    pub fn stack_count(&self) -> u32 {
        self.shape.stack_count
    }

    #[must_use]
    pub fn stabilization_count(&self) -> u32 {
        self.shape.stabilization_count
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.shape.is_flat()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Look a tile up by its parsed name, whatever its extension
    #[must_use]
    pub fn find(&self, tile: &TileRef) -> Option<&IndexedTile> {
        self.grid
            .get(&tile.coordinate())?
            .iter()
            .filter_map(|name| self.images.get(name))
            .find(|indexed| indexed.tile == *tile)
    }

    /// Formats present in the scan
    #[must_use]
    pub fn formats(&self) -> Vec<ImageFormat> {
        let mut formats: Vec<ImageFormat> = self.images.values().map(|t| t.format).collect();
        formats.sort_by_key(|f| f.extension());
        formats.dedup();
        formats
    }
}

/// Build an index from whatever tile files are on disk right now
pub fn index_directory(directory: impl AsRef<Path>) -> Result<ScanIndex, ScanError> {
    let directory = directory.as_ref();
    let io_err = |source| ScanError::Io {
        path: directory.to_path_buf(),
        source,
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(directory).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    build_index(directory, names)
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name == PROCESSING_SENTINEL || name == UPLOAD_MARKER
}

fn build_index(directory: &Path, names: Vec<String>) -> Result<ScanIndex, ScanError> {
    let mut images = BTreeMap::new();
    let mut grid: BTreeMap<(u32, u32), Vec<String>> = BTreeMap::new();
    let mut by_tile: BTreeMap<TileRef, String> = BTreeMap::new();
    let mut first: Option<(String, (bool, bool, bool))> = None;
    let mut shape = ScanShape::default();

    for name in names {
        let (tile, format) = TileRef::parse(&name)?;

        match &first {
            None => first = Some((name.clone(), tile.axes_present())),
            Some((first_name, axes)) if *axes != tile.axes_present() => {
                return Err(ScanError::Inhomogeneous {
                    first: first_name.clone(),
                    other: name,
                });
            }
            Some(_) => {}
        }

        if let Some(existing) = by_tile.insert(tile, name.clone()) {
            return Err(ScanError::DuplicateTile(existing, name));
        }

        shape.cols = shape.cols.max(tile.col + 1);
        shape.rows = shape.rows.max(tile.row + 1);
        if let Some(z) = tile.stack {
            shape.stack_count = shape.stack_count.max(z + 1);
        }
        if let Some(h) = tile.hdr {
            shape.hdr_count = shape.hdr_count.max(h + 1);
        }
        if let Some(f) = tile.stabilization {
            shape.stabilization_count = shape.stabilization_count.max(f + 1);
        }

        grid.entry(tile.coordinate()).or_default().push(name.clone());
        images.insert(
            name.clone(),
            IndexedTile {
                tile,
                format,
                path: directory.join(&name),
            },
        );
    }

    debug!(
        "Indexed {}: {} images, {}x{} grid, hdr={} stack={} stabilization={}",
        directory.display(),
        images.len(),
        shape.cols,
        shape.rows,
        shape.hdr_count,
        shape.stack_count,
        shape.stabilization_count
    );

    Ok(ScanIndex {
        directory: directory.to_path_buf(),
        images,
        grid,
        shape,
    })
}

/// Stable key for the bucket `tile` falls into when fusing along `axis`
#[must_use]
pub fn bucket_key(tile: &TileRef, axis: Axis) -> TileRef {
    tile.without(axis)
}

/// Tiles grouped for fusion along one axis
#[derive(Debug, Clone)]
pub struct Bucket {
    axis: Axis,
    expected: usize,
    members: BTreeMap<TileRef, BTreeMap<u32, IndexedTile>>,
}

impl Bucket {
    /// Start an empty bucket set expecting `expected` members per key
    #[must_use]
    pub fn new(axis: Axis, expected: usize) -> Self {
        Self {
            axis,
            expected,
            members: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn axis(&self) -> Axis {
        self.axis
    }

    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Add a tile; returns its key and whether that key is now full
    pub fn insert(&mut self, indexed: IndexedTile) -> Option<(TileRef, bool)> {
        let index = indexed.tile.axis(self.axis)?;
        let key = bucket_key(&indexed.tile, self.axis);
        let members = self.members.entry(key).or_default();
        members.insert(index, indexed);
        let full = members.len() == self.expected;
        Some((key, full))
    }

    /// Members of one key ordered by their axis index
    #[must_use]
    pub fn members(&self, key: &TileRef) -> Option<&BTreeMap<u32, IndexedTile>> {
        self.members.get(key)
    }

    #[must_use]
    pub fn is_full(&self, key: &TileRef) -> bool {
        self.members
            .get(key)
            .is_some_and(|m| m.len() == self.expected)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TileRef> {
        self.members.keys()
    }

    /// Buckets that are safe to fuse
    pub fn full_buckets(&self) -> impl Iterator<Item = (&TileRef, &BTreeMap<u32, IndexedTile>)> {
        self.members
            .iter()
            .filter(move |(_, m)| m.len() == self.expected)
    }

    /// Buckets still missing variants
    pub fn partial_buckets(
        &self,
    ) -> impl Iterator<Item = (&TileRef, &BTreeMap<u32, IndexedTile>)> {
        self.members
            .iter()
            .filter(move |(_, m)| m.len() != self.expected)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Group an index's tiles by everything except `axis`
#[must_use]
pub fn bucket(index: &ScanIndex, axis: Axis) -> Bucket {
    let mut bucket = Bucket::new(axis, index.shape().count(axis) as usize);
    for indexed in index.images().values() {
        bucket.insert(indexed.clone());
    }
    bucket
}
