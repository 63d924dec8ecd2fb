mod config;
mod discovery;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use derivative_store::DerivativeStore;
use image_derivatives::{
    DeriveError, DerivativeBuilder, ImageHandle, ReconcileReport, Rotation, Session, SourceImage,
    WorkingSetObserver,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "photozip")]
#[command(about = "Collect photos, cache their previews and export rotated, renamed copies")]
struct Cli {
    /// Derivative database to use instead of the configured one
    #[arg(long, env = "PHOTOZIP_DB", global = true)]
    db: Option<PathBuf>,

    /// Config file to use instead of the per-user one
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drop cache entries for deleted files and rebuild entries for changed ones
    Reconcile,

    /// Add images (or directories of images) and build their thumbnails
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory levels to search (overrides scan_depth)
        #[arg(long)]
        depth: Option<usize>,
    },

    /// Write the rotated working copy of one image
    Render {
        path: PathBuf,

        /// Clockwise rotation: 0, 90, 180 or 270
        #[arg(long, default_value = "0")]
        rotate: Rotation,

        /// Output file; its extension picks the encoding
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show cache statistics
    Stats,

    /// Delete every cached derivative
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init()?;

    let config = Config::load(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path.clone());

    match cli.command {
        Commands::Reconcile => {
            let session = start_session(&db_path, &config)?;
            print_reconcile_report(session.reconcile_report());
            Ok(())
        }
        Commands::Add { paths, depth } => {
            let session = start_session(&db_path, &config)?;
            add_images(&session, &paths, depth.unwrap_or(config.scan_depth))
        }
        Commands::Render { path, rotate, out } => {
            let session = start_session(&db_path, &config)?;
            render(&session, &path, rotate, &out)
        }
        Commands::Stats => {
            let store = open_store(&db_path)?;
            println!("📁 Database: {}", store.path().display());
            println!("🖼️  Cached images: {}", store.count()?);
            Ok(())
        }
        Commands::Clear => {
            let store = open_store(&db_path)?;
            let removed = store.clear()?;
            println!("🗑️  Removed {} cached entries", removed);
            Ok(())
        }
    }
}

fn open_store(db_path: &Path) -> Result<DerivativeStore> {
    DerivativeStore::open_at(db_path)
        .with_context(|| format!("Failed to open derivative database {}", db_path.display()))
}

/// Open the store and reconcile it before anything else touches it.
fn start_session(db_path: &Path, config: &Config) -> Result<Session> {
    info!(db = %db_path.display(), "starting session");
    let store = Arc::new(open_store(db_path)?);
    let builder = Arc::new(DerivativeBuilder::new(store, config.derivatives.clone()));
    Session::start(builder).context("Failed to reconcile derivative cache")
}

fn print_reconcile_report(report: &ReconcileReport) {
    println!("🔍 Checked {} cached images", report.checked);
    println!("   {} unchanged", report.unchanged());
    println!("   {} removed (source deleted)", report.removed);
    println!("   {} refreshed (source modified)", report.refreshed);
    if !report.is_clean() {
        println!("⚠️  {} entries could not be verified:", report.unverified.len());
        for path in &report.unverified {
            println!("   {}", path);
        }
    }
}

/// Prints build outcomes as the background worker reports them.
struct ConsoleReporter;

impl WorkingSetObserver for ConsoleReporter {
    fn on_build_completed(&self, handle: &ImageHandle) {
        println!("✅ {}", handle.display_name());
    }

    fn on_build_failed(&self, handle: &ImageHandle, error: &DeriveError) {
        println!("❌ {}: {}", handle.path().display(), error);
    }
}

fn add_images(session: &Session, paths: &[PathBuf], depth: usize) -> Result<()> {
    let images = discovery::discover_images(paths, depth)?;
    if images.is_empty() {
        println!("⚠️  No supported image files found");
        return Ok(());
    }

    session.subscribe(Arc::new(ConsoleReporter));
    println!("📸 Adding {} images", images.len());

    let mut rejected = 0;
    for path in &images {
        let added = match session.add_to_working_set(path) {
            Err(DeriveError::DuplicateName(name)) => {
                let unique = unique_name(session, &name);
                println!("✏️  {} renamed to {} (name already taken)", path.display(), unique);
                session.add_named(path, &unique)
            }
            other => other,
        };
        if let Err(e) = added {
            println!("❌ {}", e);
            rejected += 1;
        }
    }

    session.wait_for_builds();

    let progress = session.progress();
    println!(
        "\n📊 {} built, {} failed, {} rejected",
        progress.completed, progress.failed, rejected
    );
    Ok(())
}

/// First free `stem-N.ext` variant of `name` in the session's working set.
fn unique_name(session: &Session, name: &str) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (2..)
        .map(|n| format!("{}-{}{}", stem, n, ext))
        .find(|candidate| session.working_set().find_by_name(candidate).is_none())
        .unwrap_or_else(|| name.to_string())
}

fn render(session: &Session, path: &Path, rotation: Rotation, out: &Path) -> Result<()> {
    let source = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let out_name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Output path has no file name: {}", out.display()))?;

    let handle = ImageHandle::with_name(SourceImage::new(source), out_name);
    handle.rotate_to(rotation);

    let bytes = session
        .export_bytes(&handle)
        .with_context(|| format!("Failed to render {}", path.display()))?;
    std::fs::write(out, &bytes)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!("💾 Wrote {} ({} bytes, {})", out.display(), bytes.len(), rotation);
    Ok(())
}
