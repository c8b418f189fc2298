//! Directory-wide binary patches for installed application trees.
//!
//! A patch archive holds a text index of added, modified and deleted files
//! plus a payload tree with full bytes for additions and delta blobs for
//! modifications. [`PatchBuilder`] produces one from two directory trees,
//! [`PatchApplier`] applies one under checksum guard, and [`Updater`]
//! chains them by version number against a [`RemoteCatalog`].

pub mod apply;
pub mod archive;
pub mod binary_diff;
pub mod binary_patch;
pub mod builder;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod delta;
pub mod deploy;
pub mod diff;
pub mod error;
pub mod index;
pub mod patch_format;
pub mod planner;
mod rolling_hash;
pub mod update;
pub mod util;
pub mod version;

pub use apply::PatchApplier;
pub use archive::{ArchiveCodec, BundleArchive};
pub use builder::{BuiltPatch, PatchBuilder};
pub use catalog::{DirectoryCatalog, RemoteCatalog, RemoteObject};
pub use checksum::Checksum;
pub use config::{BuildConfig, Codecs, DeployConfig, ToolPaths, UpdateConfig};
pub use delta::{BlockDeltaCodec, DeltaCodec, ExternalToolCodec};
pub use deploy::{Deployer, Deployment};
pub use error::PatchError;
pub use index::{FileChangeEntry, IndexShard, Operation, PatchIndex};
pub use patch_format::{ApplyReport, BuildSummary, CorruptFile};
pub use planner::{PatchDescriptor, PlanReason, UpdatePlan};
pub use update::{UpdateOutcome, Updater};
