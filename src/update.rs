//! Autoupdate: plan against the server, then patch or reinstall.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::apply::PatchApplier;
use crate::catalog::{self, RemoteCatalog, RemoteObject, TransferProgress};
use crate::config::{Codecs, UpdateConfig};
use crate::patch_format::CorruptFile;
use crate::planner::{self, PatchDescriptor, PlanReason, UpdatePlan};
use crate::util;

/// Unpacked full packages land here inside the temp dir.
const PACKAGE_DIR: &str = "package";

#[derive(Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate,
    Patched {
        versions: Vec<u32>,
        /// Files that failed post-validation in any of the patches.
        corrupt: Vec<CorruptFile>,
    },
    Reinstalled { reason: PlanReason },
}

pub struct Updater {
    config: UpdateConfig,
    catalog: Arc<dyn RemoteCatalog>,
    codecs: Codecs,
}

impl Updater {
    pub fn new(config: UpdateConfig, catalog: Arc<dyn RemoteCatalog>, codecs: Codecs) -> Self {
        Self {
            config,
            catalog,
            codecs,
        }
    }

    pub async fn run(&self) -> Result<UpdateOutcome> {
        log::info!("Checking for updates...");
        let plan = {
            let catalog = Arc::clone(&self.catalog);
            let install = self.config.install_dir.clone();
            tokio::task::spawn_blocking(move || planner::plan(&install, catalog.as_ref())).await??
        };

        match plan {
            UpdatePlan::NoOp => {
                log::info!("Already up to date.");
                Ok(UpdateOutcome::UpToDate)
            }
            UpdatePlan::ApplyPatches(chain) => self.patch(chain).await,
            UpdatePlan::FullReinstall { reason } => {
                self.reinstall().await?;
                Ok(UpdateOutcome::Reinstalled { reason })
            }
        }
    }

    async fn patch(&self, chain: Vec<PatchDescriptor>) -> Result<UpdateOutcome> {
        let total: u64 = chain.iter().map(|p| p.size).sum();
        log::info!(
            "Downloading {} patches ({} MB)",
            chain.len(),
            total / 1_000_000
        );
        let files = {
            let catalog = Arc::clone(&self.catalog);
            let temp = self.config.temp_dir.clone();
            let chain = chain.clone();
            tokio::task::spawn_blocking(move || download_chain(catalog.as_ref(), &chain, &temp, total))
                .await??
        };

        let applier = PatchApplier::new(self.codecs.clone());
        let mut corrupt = Vec::new();
        for (patch, file) in chain.iter().zip(&files) {
            log::info!("Installing patch v{}", patch.version);
            let report = applier
                .apply(file, &self.config.install_dir)
                .await
                .with_context(|| format!("Failed to install patch v{}", patch.version))?;
            corrupt.extend(report.corrupt);
        }

        remove_temp(&self.config.temp_dir);
        Ok(UpdateOutcome::Patched {
            versions: chain.iter().map(|p| p.version).collect(),
            corrupt,
        })
    }

    async fn reinstall(&self) -> Result<()> {
        let catalog = Arc::clone(&self.catalog);
        let codecs = self.codecs.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let size = catalog.size(RemoteObject::Latest)?;
            log::info!("Downloading full application ({} MB)...", size / 1_000_000);
            util::reset_dir(&config.temp_dir)?;

            let blob = config.temp_dir.join(RemoteObject::Latest.to_string());
            let mut progress = TransferProgress::new(size);
            catalog::download(catalog.as_ref(), RemoteObject::Latest, &blob, &mut |n| progress.add(n))?;

            log::info!("Extracting files...");
            let package = config.temp_dir.join(PACKAGE_DIR);
            codecs.archive.unpack(&blob, &package)?;

            install_package(&package, &config.install_dir)?;

            remove_temp(&config.temp_dir);
            log::info!("Done.");
            Ok(())
        })
        .await?
    }
}

/// Swap `package` in as `install`. The old install is moved aside first and
/// only removed once the new tree is in place; if the move fails it is put
/// back.
fn install_package(package: &Path, install: &Path) -> Result<()> {
    let previous = if install.exists() {
        log::info!("Moving old files aside...");
        Some(util::move_aside(install)?)
    } else {
        if let Some(parent) = install.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        None
    };

    log::info!("Copying new files...");
    if let Err(e) = util::move_dir(package, install) {
        if let Some(previous) = &previous {
            if install.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(install) {
                    log::warn!("Failed to remove {}: {}", install.display(), cleanup);
                }
            }
            if let Err(restore) = std::fs::rename(previous, install) {
                log::warn!(
                    "Failed to restore {} from {}: {}",
                    install.display(),
                    previous.display(),
                    restore
                );
            }
        }
        return Err(e.context(format!("Failed to install package into {}", install.display())));
    }

    if let Some(previous) = previous {
        log::info!("Deleting old files...");
        if let Err(e) = std::fs::remove_dir_all(&previous) {
            log::warn!("Failed to remove {}: {}", previous.display(), e);
        }
    }
    Ok(())
}

fn download_chain(
    catalog: &dyn RemoteCatalog,
    chain: &[PatchDescriptor],
    temp: &Path,
    total: u64,
) -> Result<Vec<PathBuf>> {
    util::reset_dir(temp)?;
    let mut progress = TransferProgress::new(total);
    let mut files = Vec::with_capacity(chain.len());
    for patch in chain {
        let object = RemoteObject::Patch(patch.version);
        let dest = temp.join(RemoteObject::patch_name(patch.version));
        catalog::download(catalog, object, &dest, &mut |n| progress.add(n))?;
        files.push(dest);
    }
    Ok(files)
}

fn remove_temp(temp: &Path) {
    if let Err(e) = std::fs::remove_dir_all(temp) {
        log::warn!("Failed to remove {}: {}", temp.display(), e);
    }
}
