//! Micrograph Pipeline Core - plugin-based grid-scan post-processing
//!
//! This crate turns a directory of tiled micrographs (optionally captured at
//! several exposures, focus heights and repeated frames per tile) into one
//! corrected image per grid cell. It provides the scan indexer, the plugin
//! contract, the worker pool that runs plugins and the orchestrators that
//! sequence them.

pub mod barrier;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod image_ref;
pub mod orchestrator;
pub mod plugin;
pub mod provenance;
pub mod registry;
pub mod scan;
pub mod stage;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use barrier::{BarrierTicket, TaskBarrier};
pub use config::{CorrectionOrder, FailurePolicy, PipelineConfig, UploadConfig};
pub use context::{Context, ExecutionMode};
pub use dispatcher::{CompletionCallback, Dispatcher, TaskReport, TaskRequest, WorkerPool};
pub use error::{PipelineError, PluginError, RegistryError, ScanError, TaskFailure};
pub use image_ref::{ImageRead, ImageWrite, ScratchAllocator};
pub use orchestrator::{DirectoryOrchestrator, SnapshotOrchestrator, StreamingOrchestrator};
pub use plugin::{check_arity, check_inputs, names, Arity, Plugin, PluginFactory};
pub use provenance::{ProcessingRecord, StageStats};
pub use registry::{PluginInfo, Registry};
pub use scan::{
    bucket, bucket_key, index_directory, Axis, Bucket, IndexedTile, ScanIndex, ScanShape, TileRef,
    PROCESSING_SENTINEL, UPLOAD_MARKER,
};
pub use stage::{Stage, StageKind, StagePlan};
pub use upload::{is_uploaded, write_upload_marker, CommandUploader, Uploader};
