//! Buildsync CLI - latest-build server and manifest tooling.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use buildsync::async_service::{fetch_latest_build, AsyncBuildService};
use buildsync::{
    scan_directory, BranchId, BuildId, BuildRequest, Config, DiffEngine, DiffStats,
    DirectoryStore, Manifest, ManifestChecksum, ManifestDiff, ServiceBuilder, Target,
    DEFAULT_BLOCK_SIZE,
};

/// Buildsync - serve the latest build of a branch as a manifest or a diff
#[derive(Parser)]
#[command(name = "buildsync")]
#[command(version)]
#[command(about = "Latest-build resolution with block-level manifest diffs")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve GetLatestBuild requests from a directory store
    Serve {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured listen address
        #[arg(short, long)]
        listen: Option<String>,

        /// Override the configured store root
        #[arg(short, long)]
        store: Option<PathBuf>,
    },

    /// Build a manifest from a directory
    Scan {
        /// Directory to scan
        #[arg(required = true)]
        dir: PathBuf,

        /// Output manifest file (default: <dir>.manifest)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum block size (4096-67108864, power of 2)
        #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,
    },

    /// Print the checksum of a manifest file
    Checksum {
        /// Manifest file
        #[arg(required = true)]
        manifest: PathBuf,
    },

    /// Compare two manifest files
    Diff {
        /// Manifest of the installed build
        #[arg(required = true)]
        old: PathBuf,

        /// Manifest of the latest build
        #[arg(required = true)]
        new: PathBuf,

        /// Write the diff (bincode) to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check an installed directory against a manifest
    Verify {
        /// Manifest file
        #[arg(required = true)]
        manifest: PathBuf,

        /// Installation directory
        #[arg(required = true)]
        dir: PathBuf,
    },

    /// Create every file of a manifest at its final size
    Preallocate {
        /// Manifest file
        #[arg(required = true)]
        manifest: PathBuf,

        /// Installation directory
        #[arg(required = true)]
        dir: PathBuf,
    },

    /// Ask a server for the latest build
    Fetch {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:47200")]
        addr: String,

        /// Branch to resolve
        #[arg(short, long)]
        branch: u64,

        /// Acceptable target, in order of preference (repeatable)
        #[arg(short, long = "target", required = true)]
        targets: Vec<Target>,

        /// Installed build id (hex)
        #[arg(long)]
        local_build: Option<BuildId>,

        /// Manifest of the installed build, used to rebuild the latest one
        #[arg(long, requires = "local_build")]
        local_manifest: Option<PathBuf>,

        /// Write the latest manifest to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Serve {
            config,
            listen,
            store,
        } => run_serve(config.as_deref(), listen, store).await,
        Commands::Scan {
            dir,
            output,
            block_size,
        } => {
            init_logging("warn");
            run_scan(dir, output, block_size).await
        }
        Commands::Checksum { manifest } => {
            init_logging("warn");
            run_checksum(&manifest)
        }
        Commands::Diff { old, new, output } => {
            init_logging("warn");
            run_diff(&old, &new, output.as_deref())
        }
        Commands::Verify { manifest, dir } => {
            init_logging("warn");
            run_verify(manifest, dir).await
        }
        Commands::Preallocate { manifest, dir } => {
            init_logging("warn");
            run_preallocate(&manifest, &dir)
        }
        Commands::Fetch {
            addr,
            branch,
            targets,
            local_build,
            local_manifest,
            output,
        } => {
            init_logging("warn");
            let mut request = BuildRequest::new(BranchId::new(branch), targets);
            if let Some(id) = local_build {
                request = request.with_local_build(id);
            }
            run_fetch(&addr, &request, local_manifest.as_deref(), output.as_deref()).await
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_serve(
    config_path: Option<&Path>,
    listen: Option<String>,
    store_root: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    if let Some(root) = store_root {
        config.server.store_root = root;
    }
    config.validate()?;
    init_logging(&config.logging.filter);

    let store = DirectoryStore::open(&config.server.store_root)?;
    tracing::info!(root = %store.root().display(), "opened directory store");

    let mut service = AsyncBuildService::new(
        ServiceBuilder::with_config(config.service.clone()).build(store),
    );
    if let Some(timeout) = config.read_timeout() {
        service = service.with_idle_timeout(timeout);
    }
    let listener = TcpListener::bind(config.listen_addr()?).await?;

    service
        .serve_until(listener, config.server.max_connections, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn run_scan(
    dir: PathBuf,
    output: Option<PathBuf>,
    block_size: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = output.unwrap_or_else(|| {
        let mut p = dir.clone();
        p.set_extension("manifest");
        p
    });

    let manifest =
        tokio::task::spawn_blocking(move || scan_directory(&dir, block_size)).await??;
    write_bincode(&output, &manifest)?;

    println!(
        "Generated manifest: {} ({} files, {} blocks, {} bytes, checksum {})",
        output.display(),
        manifest.file_count(),
        manifest.block_count(),
        manifest.total_size(),
        ManifestChecksum::compute(&manifest)
    );

    Ok(())
}

fn run_checksum(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = read_manifest(path)?;
    println!("{}", ManifestChecksum::compute(&manifest));
    Ok(())
}

fn run_diff(old: &Path, new: &Path, output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let old = read_manifest(old)?;
    let new = read_manifest(new)?;
    let diff = DiffEngine::new().diff(&old, &new);

    print_diff_stats(&diff);
    if let Some(output) = output {
        write_bincode(output, &diff)?;
        println!("Wrote diff: {}", output.display());
    }
    Ok(())
}

async fn run_verify(manifest: PathBuf, dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = read_manifest(&manifest)?;
    let diff =
        tokio::task::spawn_blocking(move || manifest.verify_installation(&dir)).await??;

    if diff.is_empty() {
        println!("Installation verified");
        return Ok(());
    }
    print_diff_stats(&diff);
    for op in diff.ops.iter().take(20) {
        let kind = if op.is_add() {
            "missing"
        } else if op.is_remove() {
            "extra"
        } else {
            "changed"
        };
        println!("  {kind:<8} {}", op.location());
    }
    Err(format!("installation differs in {} blocks", diff.change_count()).into())
}

fn run_preallocate(manifest: &Path, dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = read_manifest(manifest)?;
    let required = manifest.space_required(dir)?;
    manifest.preallocate(dir)?;
    println!(
        "Preallocated {} files in {} ({} new bytes)",
        manifest.file_count(),
        dir.display(),
        required
    );
    Ok(())
}

async fn run_fetch(
    addr: &str,
    request: &BuildRequest,
    local_manifest: Option<&Path>,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = fetch_latest_build(addr, request).await?;

    println!(
        "Latest build: {} (checksum {}, {})",
        response.build_id,
        response.manifest_checksum,
        response.payload.kind()
    );
    if let Some(diff) = response.manifest_diff() {
        print_diff_stats(diff);
    }

    if let Some(output) = output {
        let local = local_manifest.map(read_manifest).transpose()?;
        let latest = response.reconstruct(local.as_ref())?;
        write_bincode(output, &latest)?;
        println!(
            "Wrote manifest: {} ({} files, {} blocks)",
            output.display(),
            latest.file_count(),
            latest.block_count()
        );
    }
    Ok(())
}

fn print_diff_stats(diff: &ManifestDiff) {
    let stats = DiffStats::from_diff(diff);
    println!(
        "{} changes: {} added, {} removed, {} modified",
        stats.change_count(),
        stats.adds,
        stats.removes,
        stats.modifies
    );
    println!(
        "To fetch: {} bytes in {} unique blocks ({} bytes on the wire)",
        stats.bytes_to_fetch,
        stats.unique_blocks_to_fetch,
        diff.estimated_wire_size()
    );
}

fn read_manifest(path: &Path) -> Result<Manifest, Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let manifest: Manifest = bincode::deserialize(&data)?;
    manifest.validate()?;
    Ok(manifest)
}

fn write_bincode<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    let serialized = bincode::serialize(value)?;
    std::fs::write(path, serialized)?;
    Ok(())
}
