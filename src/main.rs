use clap::{Args, Parser, Subcommand};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dirpatch::{
    BuildConfig, Codecs, DeployConfig, Deployer, DirectoryCatalog, PatchApplier, PatchBuilder,
    ToolPaths, UpdateConfig, UpdateOutcome, Updater,
};

#[derive(Parser)]
#[command(name = "dirpatch", about = "Directory-wide binary patch builder, applier and updater")]
struct Cli {
    /// More output (-v: every index entry, -vv: every file visited)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ToolArgs {
    /// Use this bsdiff binary instead of the built-in delta codec (needs --bspatch)
    #[arg(long, requires = "bspatch")]
    bsdiff: Option<PathBuf>,
    /// Use this bspatch binary instead of the built-in delta codec (needs --bsdiff)
    #[arg(long, requires = "bsdiff")]
    bspatch: Option<PathBuf>,
}

impl ToolArgs {
    fn codecs(&self) -> anyhow::Result<Codecs> {
        Codecs::from_tools(&ToolPaths {
            diff_tool: self.bsdiff.clone(),
            patch_tool: self.bspatch.clone(),
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Diff {
        /// Path to the old (original) directory
        old: PathBuf,
        /// Path to the new (updated) directory
        new: PathBuf,
        /// Output directory; the patch is written as patch_temp.bundle
        out: PathBuf,
        /// Parallel workers for the old-tree pass
        #[arg(short = 'j', long, default_value = "1")]
        jobs: NonZeroUsize,
        #[command(flatten)]
        tools: ToolArgs,
    },
    /// Apply a patch to a target directory
    Patch {
        /// Path to the patch file
        patch: PathBuf,
        /// Path to the target directory to patch
        target: PathBuf,
        #[command(flatten)]
        tools: ToolArgs,
    },
    /// Bring an installed application up to date from an update server
    Update {
        /// Installed application directory (holds VERSION)
        install: PathBuf,
        /// Temp directory; wiped on every run
        temp: PathBuf,
        /// Update server root (contains `latest` and `patches/`)
        server: PathBuf,
        #[command(flatten)]
        tools: ToolArgs,
    },
    /// Build and publish the patch and full package for a new version
    Deploy {
        /// Last uploaded build
        old: PathBuf,
        /// Build to be deployed
        new: PathBuf,
        /// Temp directory; wiped on every run
        temp: PathBuf,
        /// Where to keep the published files locally
        out: PathBuf,
        /// Update server root
        server: PathBuf,
        /// Write old VERSION + 1 into the new build first
        #[arg(long)]
        bump_version: bool,
        /// Parallel workers for the old-tree pass
        #[arg(short = 'j', long, default_value = "1")]
        jobs: NonZeroUsize,
        #[command(flatten)]
        tools: ToolArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Diff {
            old,
            new,
            out,
            jobs,
            tools,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", out.display());
            println!("  Workers: {jobs}");

            let start = Instant::now();
            let built = PatchBuilder::new(BuildConfig::with_workers(jobs), tools.codecs()?)
                .build(&old, &new, &out)
                .await?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Patch file: {}", built.archive.display());
            println!("  Files added: {}", built.summary.files_added);
            println!("  Files modified: {}", built.summary.files_modified);
            println!("  Files deleted: {}", built.summary.files_deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Patch {
            patch,
            target,
            tools,
        } => {
            println!("Applying patch...");
            println!("  Patch: {}", patch.display());
            println!("  Target: {}", target.display());

            let start = Instant::now();
            let report = PatchApplier::new(tools.codecs()?).apply(&patch, &target).await?;
            let elapsed = start.elapsed();

            if report.is_clean() {
                println!("\nPatch applied successfully!");
            } else {
                println!(
                    "\nPatch applied, but {} file(s) are corrupted. Please reinstall the full release.",
                    report.corrupt.len()
                );
            }
            println!("  Files added: {}", report.files_added);
            println!("  Files modified: {}", report.files_modified);
            println!("  Files deleted: {}", report.files_deleted);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Update {
            install,
            temp,
            server,
            tools,
        } => {
            let config = UpdateConfig {
                install_dir: install,
                temp_dir: temp,
            };
            let updater = Updater::new(config, Arc::new(DirectoryCatalog::new(server)), tools.codecs()?);
            match updater.run().await? {
                UpdateOutcome::UpToDate => println!("Already up to date."),
                UpdateOutcome::Patched { versions, corrupt } => {
                    println!("Installed {} patch(es): {:?}", versions.len(), versions);
                    if !corrupt.is_empty() {
                        println!(
                            "{} file(s) are corrupted. Please reinstall the full release.",
                            corrupt.len()
                        );
                    }
                }
                UpdateOutcome::Reinstalled { reason } => {
                    println!("Reinstalled the full application ({reason:?})")
                }
            }
        }
        Commands::Deploy {
            old,
            new,
            temp,
            out,
            server,
            bump_version,
            jobs,
            tools,
        } => {
            let config = DeployConfig {
                old_dir: old,
                new_dir: new,
                temp_dir: temp,
                out_dir: out,
                bump_version,
                build: BuildConfig::with_workers(jobs),
            };
            let start = Instant::now();
            let deployed = Deployer::new(config, Arc::new(DirectoryCatalog::new(server)), tools.codecs()?)
                .run()
                .await?;
            println!("\nDeployed v{}", deployed.version);
            println!("  Patch: {}", deployed.patch.display());
            println!("  Package: {}", deployed.package.display());
            println!("  Files added: {}", deployed.summary.files_added);
            println!("  Files modified: {}", deployed.summary.files_modified);
            println!("  Files deleted: {}", deployed.summary.files_deleted);
            println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
        }
    }

    Ok(())
}
