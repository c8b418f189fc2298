//! Explicit settings for each entry point. Nothing here is global; callers
//! build a struct and hand it to the builder, applier, updater or deployer.

use anyhow::{bail, Result};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::{ArchiveCodec, BundleArchive};
use crate::delta::{BlockDeltaCodec, DeltaCodec, ExternalToolCodec};
use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    /// Threads diffing the old tree.
    pub workers: NonZeroUsize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            workers: NonZeroUsize::MIN,
        }
    }
}

impl BuildConfig {
    pub fn with_workers(workers: NonZeroUsize) -> Self {
        Self { workers }
    }
}

/// Paths to `bsdiff`/`bspatch`. When unset the built-in codec is used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolPaths {
    pub diff_tool: Option<PathBuf>,
    pub patch_tool: Option<PathBuf>,
}

/// The pair of collaborators every build and apply needs.
#[derive(Clone)]
pub struct Codecs {
    pub delta: Arc<dyn DeltaCodec>,
    pub archive: Arc<dyn ArchiveCodec>,
}

impl Default for Codecs {
    fn default() -> Self {
        Self {
            delta: Arc::new(BlockDeltaCodec),
            archive: Arc::new(BundleArchive::default()),
        }
    }
}

impl Codecs {
    /// Built-in codecs, or the external delta tools when both paths are
    /// given. Giving only one of the two is `MissingDependency` for the other.
    pub fn from_tools(tools: &ToolPaths) -> Result<Self> {
        let mut codecs = Self::default();
        match (&tools.diff_tool, &tools.patch_tool) {
            (None, None) => {}
            (Some(diff), Some(patch)) => codecs.delta = Arc::new(ExternalToolCodec::new(diff, patch)),
            (Some(_), None) => bail!(PatchError::MissingDependency {
                tool: "bspatch",
                path: PathBuf::new(),
            }),
            (None, Some(_)) => bail!(PatchError::MissingDependency {
                tool: "bsdiff",
                path: PathBuf::new(),
            }),
        }
        Ok(codecs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Installed application tree holding the `VERSION` marker.
    pub install_dir: PathBuf,
    /// Download and extraction area. Wiped at the start of every run.
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    /// Last shipped build.
    pub old_dir: PathBuf,
    /// Build being shipped.
    pub new_dir: PathBuf,
    /// Scratch area. Wiped at the start of every run.
    pub temp_dir: PathBuf,
    /// Local copy of the published artifacts (`latest`, `patches/v<N>`).
    pub out_dir: PathBuf,
    /// Write `old VERSION + 1` into the new build before diffing.
    pub bump_version: bool,
    pub build: BuildConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_uses_one_worker() {
        assert_eq!(BuildConfig::default().workers.get(), 1);
    }

    #[test]
    fn tool_paths_select_delta_codec() {
        // The built-in codec needs nothing installed.
        Codecs::from_tools(&ToolPaths::default())
            .unwrap()
            .delta
            .ensure_available()
            .unwrap();

        let tools = ToolPaths {
            diff_tool: Some(PathBuf::from("/nonexistent/bsdiff")),
            patch_tool: Some(PathBuf::from("/nonexistent/bspatch")),
        };
        assert!(Codecs::from_tools(&tools).unwrap().delta.ensure_available().is_err());
    }

    #[test]
    fn half_configured_tools_name_the_missing_one() {
        let only_diff = ToolPaths {
            diff_tool: Some(PathBuf::from("/usr/bin/bsdiff")),
            patch_tool: None,
        };
        let only_patch = ToolPaths {
            diff_tool: None,
            patch_tool: Some(PathBuf::from("/usr/bin/bspatch")),
        };
        for (tools, missing) in [(only_diff, "bspatch"), (only_patch, "bsdiff")] {
            let err = Codecs::from_tools(&tools).err().unwrap();
            match err.downcast_ref::<PatchError>() {
                Some(PatchError::MissingDependency { tool, path }) => {
                    assert_eq!(*tool, missing);
                    assert!(path.as_os_str().is_empty());
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert!(err.to_string().contains("no path given"));
        }
    }
}
