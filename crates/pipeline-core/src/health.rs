//! Health inspection and repair of a flat result

use crate::error::PipelineError;
use crate::scan::{Axis, IndexedTile, ScanIndex, TileRef, UPLOAD_MARKER};
use micrograph_common::image_io::{load_image, save_image_atomic};
use micrograph_common::ImageFormat;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Hidden list of the substitutes [`repair`] wrote into a directory
pub const REPAIR_LEDGER: &str = ".repaired.json";

/// Grid cells of `cols x rows` that a flat index has no image for, sorted
pub fn inspect(index: &ScanIndex, cols: u32, rows: u32) -> Result<Vec<(u32, u32)>, PipelineError> {
    if !index.is_flat() {
        return Err(PipelineError::NotFlat(index.directory().to_path_buf()));
    }

    let mut missing = Vec::new();
    for col in 0..cols {
        for row in 0..rows {
            if !index.grid().contains_key(&(col, row)) {
                missing.push((col, row));
            }
        }
    }
    Ok(missing)
}

/// Pick the variant closest to the middle of `axis` for one cell
fn middle_variant<'a>(
    source: &'a ScanIndex,
    cell: (u32, u32),
    axis: Axis,
) -> Option<&'a IndexedTile> {
    let middle = i64::from(source.shape().count(axis) / 2);
    source
        .grid()
        .get(&cell)?
        .iter()
        .filter_map(|name| source.images().get(name))
        .filter_map(|t| t.tile.axis(axis).map(|i| (i64::from(i), t)))
        .min_by_key(|(i, _)| ((i - middle).abs(), *i))
        .map(|(_, t)| t)
}

/// Fill missing cells of `target_dir` from the middle variant in `source`
///
/// `source` is the index that was fed into the fusion along `axis` (normally
/// the focus stack, so the middle depth is the likeliest to be sharp). Returns
/// the cells that were filled; cells with no variant at all stay missing.
/// The files written are added to [`REPAIR_LEDGER`] in `target_dir`.
pub fn repair(
    missing: &[(u32, u32)],
    source: &ScanIndex,
    axis: Axis,
    target_dir: &Path,
    format: ImageFormat,
) -> Result<Vec<(u32, u32)>, PipelineError> {
    let mut repaired = Vec::new();
    let mut written = Vec::new();

    for &(col, row) in missing {
        let Some(substitute) = middle_variant(source, (col, row), axis) else {
            warn!(
                "Cannot repair c{:03}_r{:03}: no {} variant available in {}",
                col,
                row,
                axis,
                source.directory().display()
            );
            continue;
        };

        let name = TileRef::cell(col, row).file_name(format);
        let target = target_dir.join(&name);
        warn!(
            "Repairing missing cell c{:03}_r{:03} with {}",
            col,
            row,
            substitute.path.display()
        );
        let img = load_image(&substitute.path)?;
        save_image_atomic(&img, &target, format)?;
        repaired.push((col, row));
        written.push(name);
    }

    if !written.is_empty() {
        let mut ledger = read_ledger(target_dir)?;
        ledger.extend(written);
        fs::write(target_dir.join(REPAIR_LEDGER), serde_json::to_string(&ledger)?)?;
    }
    Ok(repaired)
}

fn read_ledger(dir: &Path) -> Result<Vec<String>, PipelineError> {
    match fs::read_to_string(dir.join(REPAIR_LEDGER)) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: &Path) -> Result<bool, PipelineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete the substitutes an earlier [`repair`] left in `dir`
///
/// They would otherwise satisfy a lazy skip and the health check forever. The
/// upload marker goes with them, as the uploaded grid contained them. Returns
/// how many were removed.
pub fn discard_repairs(dir: &Path) -> Result<usize, PipelineError> {
    let ledger = read_ledger(dir)?;
    if ledger.is_empty() {
        return Ok(0);
    }

    let mut removed = 0;
    for name in &ledger {
        if remove_if_present(&dir.join(name))? {
            removed += 1;
        }
    }
    remove_if_present(&dir.join(UPLOAD_MARKER))?;
    remove_if_present(&dir.join(REPAIR_LEDGER))?;
    info!(
        "Discarded {} repaired substitute(s) in {}",
        removed,
        dir.display()
    );
    Ok(removed)
}
