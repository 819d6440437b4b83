//! Stage planning: which transforms a scan needs, in which order, writing where
//!
//! Every stage writes into a subdirectory of the previous stage's output, named
//! after the stage. The names are fixed so that a second run finds the first
//! run's outputs and (in lazy mode) skips them.

use crate::config::{CorrectionOrder, PipelineConfig};
use crate::error::RegistryError;
use crate::plugin::{names, Arity};
use crate::registry::Registry;
use crate::scan::{Axis, ScanShape, TileRef};
use micrograph_common::ImageFormat;
use std::fmt;

/// What a stage does with its input index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// 1→1 on every image
    Correction,
    /// N→1 on every full bucket along an axis
    Fusion(Axis),
}

/// One step of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Output subdirectory name
    pub directory: String,
    pub plugin: String,
    pub kind: StageKind,
    /// Format of the files this stage writes
    pub format: ImageFormat,
}

impl Stage {
    pub fn correction(directory: impl Into<String>, plugin: impl Into<String>, format: ImageFormat) -> Self {
        Self {
            directory: directory.into(),
            plugin: plugin.into(),
            kind: StageKind::Correction,
            format,
        }
    }

    pub fn fusion(axis: Axis, format: ImageFormat) -> Self {
        let (directory, plugin) = match axis {
            Axis::Stabilization => ("stabilized", names::STABILIZATION),
            Axis::Hdr => ("exposure_fused", names::EXPOSURE_FUSION),
            Axis::Stack => ("stacked", names::FOCUS_STACK),
        };
        Self {
            directory: directory.to_string(),
            plugin: plugin.to_string(),
            kind: StageKind::Fusion(axis),
            format,
        }
    }

    /// Conversion of a flat result into the upload format
    pub fn conversion(format: ImageFormat) -> Self {
        Self::correction(
            format!("upload_{}", format.extension()),
            names::FORMAT_CONVERSION,
            format,
        )
    }

    #[must_use]
    pub fn arity(&self) -> Arity {
        match self.kind {
            StageKind::Correction => Arity::Correction,
            StageKind::Fusion(_) => Arity::Fusion,
        }
    }

    /// Key this stage writes for an input tile
    #[must_use]
    pub fn output_key(&self, tile: &TileRef) -> TileRef {
        match self.kind {
            StageKind::Correction => *tile,
            StageKind::Fusion(axis) => tile.without(axis),
        }
    }

    /// File name written for an output key
    #[must_use]
    pub fn output_name(&self, key: &TileRef) -> String {
        key.file_name(self.format)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.directory, self.plugin)
    }
}

/// Ordered transform stages for one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Plan the stages a scan of this shape needs
    ///
    /// Pre-corrections, then stabilization, exposure fusion and focus stacking
    /// for the axes the scan varies in, then post-corrections and flat-field in
    /// the configured order.
    #[must_use]
    pub fn for_shape(shape: &ScanShape, config: &PipelineConfig) -> Self {
        let format = config.working_format;
        let mut stages = Vec::new();

        for plugin in &config.pre_corrections {
            stages.push(Stage::correction(format!("pre_{plugin}"), plugin.as_str(), format));
        }

        for axis in [Axis::Stabilization, Axis::Hdr, Axis::Stack] {
            if shape.count(axis) > 0 {
                stages.push(Stage::fusion(axis, format));
            }
        }

        let post = config
            .post_corrections
            .iter()
            .map(|plugin| Stage::correction(format!("post_{plugin}"), plugin.as_str(), format));
        let flat_field = config
            .flat_field
            .as_ref()
            .map(|_| Stage::correction("flat_field", names::FLAT_FIELD, format));

        match config.correction_order {
            CorrectionOrder::FlatFieldLast => {
                stages.extend(post);
                stages.extend(flat_field);
            }
            CorrectionOrder::FlatFieldFirst => {
                stages.extend(flat_field);
                stages.extend(post);
            }
        }

        Self { stages }
    }

    /// Only the post-fusion corrections, in order (the snapshot chain)
    #[must_use]
    pub fn corrections_only(config: &PipelineConfig) -> Self {
        let flat = ScanShape::default();
        let mut plan = Self::for_shape(&flat, config);
        let skip = config.pre_corrections.len();
        plan.stages.drain(..skip);
        plan
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Position of the last fusion stage
    #[must_use]
    pub fn last_fusion(&self) -> Option<usize> {
        self.stages
            .iter()
            .rposition(|s| matches!(s.kind, StageKind::Fusion(_)))
    }

    /// Fail unless every stage's plugin is registered with a matching arity
    pub fn validate(&self, registry: &Registry) -> Result<(), RegistryError> {
        for stage in &self.stages {
            registry.require([stage.plugin.as_str()], stage.arity())?;
        }
        Ok(())
    }
}
