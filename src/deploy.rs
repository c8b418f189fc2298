//! Publishing a new build: patch from the previous build plus a full package.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::builder::PatchBuilder;
use crate::catalog::{RemoteCatalog, RemoteObject, TransferProgress, LATEST, PATCHES_DIR};
use crate::config::{Codecs, DeployConfig};
use crate::patch_format::BuildSummary;
use crate::util;
use crate::version;

#[derive(Debug)]
pub struct Deployment {
    pub version: u32,
    /// Local copy of the published patch, `<out>/patches/v<N>`.
    pub patch: PathBuf,
    /// Local copy of the full package, `<out>/latest`.
    pub package: PathBuf,
    pub summary: BuildSummary,
}

pub struct Deployer {
    config: DeployConfig,
    catalog: Arc<dyn RemoteCatalog>,
    codecs: Codecs,
}

impl Deployer {
    pub fn new(config: DeployConfig, catalog: Arc<dyn RemoteCatalog>, codecs: Codecs) -> Self {
        Self {
            config,
            catalog,
            codecs,
        }
    }

    pub async fn run(&self) -> Result<Deployment> {
        let cfg = &self.config;

        if cfg.bump_version {
            let old = version::try_read_version(&cfg.old_dir)
                .context("Cannot bump version without a readable old VERSION")?;
            log::info!("Incrementing version to {}", old + 1);
            version::write_version(&cfg.new_dir, old + 1)?;
        }
        let new_version = version::try_read_version(&cfg.new_dir)
            .context("The build being deployed has no readable VERSION")?;
        if let Some(old_version) = version::read_version(&cfg.old_dir) {
            if new_version != old_version + 1 {
                bail!(
                    "New build is v{new_version} but the previous build is v{old_version}; \
                     versions must be consecutive"
                );
            }
        }

        log::info!("Cleaning temp dir");
        util::reset_dir(&cfg.temp_dir)?;

        log::info!("Creating patch v{new_version}");
        let built = PatchBuilder::new(cfg.build, self.codecs.clone())
            .build(&cfg.old_dir, &cfg.new_dir, &cfg.temp_dir)
            .await?;
        let patches = cfg.out_dir.join(PATCHES_DIR);
        std::fs::create_dir_all(&patches)
            .with_context(|| format!("Failed to create directory: {}", patches.display()))?;
        let patch = patches.join(RemoteObject::patch_name(new_version));
        std::fs::rename(&built.archive, &patch)
            .with_context(|| format!("Failed to move patch to {}", patch.display()))?;

        log::info!("Packing full application");
        let package = cfg.out_dir.join(LATEST);
        {
            let archive = Arc::clone(&self.codecs.archive);
            let (src, dst) = (cfg.new_dir.clone(), package.clone());
            tokio::task::spawn_blocking(move || archive.pack(&src, &dst)).await??;
        }

        {
            let catalog = Arc::clone(&self.catalog);
            let (patch, package) = (patch.clone(), package.clone());
            tokio::task::spawn_blocking(move || -> Result<()> {
                for (file, object) in [
                    (&package, RemoteObject::Latest),
                    (&patch, RemoteObject::Patch(new_version)),
                ] {
                    let size = std::fs::metadata(file)?.len();
                    log::info!("Uploading {object} ({size} bytes)...");
                    let mut progress = TransferProgress::new(size);
                    catalog.store(file, object, &mut |n| progress.add(n))?;
                }
                Ok(())
            })
            .await??;
        }
        log::info!("Upload complete");

        Ok(Deployment {
            version: new_version,
            patch,
            package,
            summary: built.summary,
        })
    }
}
