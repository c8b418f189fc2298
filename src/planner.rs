//! Deciding how to bring an install up to date.

use anyhow::Result;
use std::path::Path;

use crate::catalog::{RemoteCatalog, RemoteObject};
use crate::version;

/// One downloadable patch in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchDescriptor {
    /// Version the patch produces; it applies to `version - 1`.
    pub version: u32,
    /// Transfer size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanReason {
    /// No readable `VERSION` marker, so no base for deltas.
    UnknownVersion,
    /// The patch chain would transfer more than the full package.
    ChainTooLarge { patch_bytes: u64, package_bytes: u64 },
    /// The catalog lacks this version, so the chain cannot reach the newest.
    VersionGap { missing: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePlan {
    NoOp,
    /// Apply in this exact order, one full apply per patch.
    ApplyPatches(Vec<PatchDescriptor>),
    FullReinstall { reason: PlanReason },
}

impl UpdatePlan {
    pub fn patch_bytes(&self) -> u64 {
        match self {
            UpdatePlan::ApplyPatches(chain) => chain.iter().map(|p| p.size).sum(),
            _ => 0,
        }
    }
}

/// Versions above `current` from a `patches/` listing, ascending.
pub fn newer_versions(names: &[String], current: u32) -> Vec<u32> {
    let mut versions: Vec<u32> = names
        .iter()
        .filter_map(|n| RemoteObject::parse_patch_name(n))
        .filter(|&v| v > current)
        .collect();
    versions.sort_unstable();
    versions.dedup();
    versions
}

/// First version missing from `current + 1 ..= max(versions)`, if any.
/// `versions` must be sorted ascending.
pub fn first_gap(versions: &[u32], current: u32) -> Option<u32> {
    let mut expected = current.checked_add(1)?;
    for &v in versions {
        if v != expected {
            return Some(expected);
        }
        expected = expected.checked_add(1)?;
    }
    None
}

/// Plan an update of `install_dir` from `catalog`.
///
/// A gap anywhere in the chain means the newest version cannot be reached by
/// patching, so the plan falls back to a full reinstall.
pub fn plan(install_dir: &Path, catalog: &dyn RemoteCatalog) -> Result<UpdatePlan> {
    let Some(current) = version::read_version(install_dir) else {
        log::warn!("Could not find current version");
        return Ok(UpdatePlan::FullReinstall {
            reason: PlanReason::UnknownVersion,
        });
    };
    log::info!("Installed version: {current}");

    let versions = newer_versions(&catalog.list_patches()?, current);
    if versions.is_empty() {
        return Ok(UpdatePlan::NoOp);
    }

    if let Some(missing) = first_gap(&versions, current) {
        log::warn!(
            "Patch v{missing} is missing from the server; cannot patch from v{current} to v{}",
            versions[versions.len() - 1]
        );
        return Ok(UpdatePlan::FullReinstall {
            reason: PlanReason::VersionGap { missing },
        });
    }

    let mut chain = Vec::with_capacity(versions.len());
    for version in versions {
        chain.push(PatchDescriptor {
            version,
            size: catalog.size(RemoteObject::Patch(version))?,
        });
    }
    let patch_bytes: u64 = chain.iter().map(|p| p.size).sum();
    let package_bytes = catalog.size(RemoteObject::Latest)?;

    if patch_bytes > package_bytes {
        log::info!(
            "Too far behind: {} patches total {patch_bytes} bytes, full package is {package_bytes}",
            chain.len()
        );
        return Ok(UpdatePlan::FullReinstall {
            reason: PlanReason::ChainTooLarge {
                patch_bytes,
                package_bytes,
            },
        });
    }

    Ok(UpdatePlan::ApplyPatches(chain))
}
