//! scad-wasm CLI entry point.
//!
//! Renders OpenSCAD sources through the WebAssembly kernel and manages the
//! asset cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use scad_wasm_common::{Capabilities, ConfigFile, EnvironmentSignals};
use scad_wasm_core::{OutputFormat, RenderOptions};
use scad_wasm_host::{AssetFetchCache, HttpFetcher, InitOptions, ModulePathResolver};
use scad_wasm_offload::create_backend;

#[derive(Debug, Parser)]
#[command(name = "scad-wasm", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "SCAD_WASM_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL or directory holding openscad.wasm.
    #[arg(long, global = true, env = "SCAD_WASM_BASE_URL")]
    base_url: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render a .scad file to a mesh.
    Render {
        /// Source file, or `-` for stdin.
        input: PathBuf,

        /// Where to write the mesh.
        #[arg(short, long)]
        output: PathBuf,

        /// stl, binstl or off.
        #[arg(long, default_value = "binstl")]
        format: OutputFormat,

        /// Use the manifold geometry kernel.
        #[arg(long)]
        manifold: bool,

        /// Render timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Skip the fonts bundle.
        #[arg(long)]
        no_fonts: bool,

        /// Skip the MCAD library.
        #[arg(long)]
        no_mcad: bool,
    },

    /// Print what this build supports.
    Capabilities,

    /// Fetch URLs into the asset cache.
    Preload {
        /// URLs to fetch in addition to the configured preload list.
        urls: Vec<String>,
    },

    /// Print asset cache statistics.
    CacheStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(base_url) = cli.base_url.clone() {
        file.runtime.loader.base_url = Some(base_url);
    }
    let signals = EnvironmentSignals::from_env().or(file.environment.clone());

    match cli.command {
        Commands::Render {
            input,
            output,
            format,
            manifold,
            timeout_ms,
            no_fonts,
            no_mcad,
        } => {
            let source = read_source(&input).await?;
            let backend = create_backend(file.runtime, signals)
                .context("Failed to create render backend")?;

            backend
                .initialize(InitOptions {
                    base_path: None,
                    include_fonts: Some(!no_fonts),
                    include_mcad: Some(!no_mcad),
                })
                .await
                .context("Failed to initialize the OpenSCAD module")?;

            let options = RenderOptions {
                enable_manifold: manifold,
                output_format: format,
                timeout_ms,
            };
            let mesh = backend
                .render(&source, &options)
                .await
                .with_context(|| format!("Failed to render {}", input.display()))?;

            tokio::fs::write(&output, &mesh)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(output = %output.display(), bytes = mesh.len(), format = %format, "Render complete");
        }

        Commands::Capabilities => {
            println!("{}", serde_json::to_string_pretty(&Capabilities::current())?);
        }

        Commands::Preload { urls } => {
            let cache = open_cache(&file)?;
            let mut resolver = ModulePathResolver::new(signals);
            if let Some(base_url) = file.runtime.loader.base_url.clone() {
                resolver = resolver.with_primary(base_url);
            }

            let mut targets = file.preload.clone();
            targets.extend(urls);
            if targets.is_empty() {
                targets = resolver.candidate_paths(&file.runtime.loader.module_file);
            }

            let requested = targets.len();
            let loaded = cache.preload_resources(targets).await;
            info!(requested, loaded, "Preload finished");
            println!("{}", serde_json::to_string_pretty(&cache.get_cache_stats())?);
        }

        Commands::CacheStats => {
            let cache = open_cache(&file)?;
            println!("{}", serde_json::to_string_pretty(&cache.get_cache_stats())?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,scad_wasm=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn read_source(input: &Path) -> anyhow::Result<String> {
    if input.as_os_str() == "-" {
        let mut source = String::new();
        tokio::io::stdin()
            .read_to_string(&mut source)
            .await
            .context("Failed to read source from stdin")?;
        return Ok(source);
    }

    tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))
}

fn open_cache(file: &ConfigFile) -> anyhow::Result<AssetFetchCache> {
    let fetcher = Arc::new(
        HttpFetcher::new(file.runtime.cache.fetch_timeout())
            .context("Failed to build HTTP client")?,
    );
    Ok(match &file.runtime.cache.cache_dir {
        Some(dir) => AssetFetchCache::persistent(fetcher, dir),
        None => AssetFetchCache::new(fetcher),
    })
}
