//! Lodestar CLI - query language servers for a workspace from a shell.
//!
//! Every subcommand goes through the same path an agent tool would: the
//! [`ServerCache`] resolves the file to its project, starts (or reuses) the
//! project's server and the query runs over the resulting client. Logs go to
//! stderr; results go to stdout.
//!
//! ```text
//! lodestar projects
//! lodestar symbols Config --within crates/core
//! lodestar definition src/main.rs 42 17
//! lodestar diagnostics src/lib.rs --wait-secs 20
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use lodestar_lsp::{IndexingOutcome, Location, LspClient, LspConfig, ServerCache, SymbolInfo, file_uri};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "lodestar", version)]
#[command(about = "Query language servers for the projects in a workspace")]
struct Cli {
    /// Workspace root (default: current directory)
    #[arg(short, long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Config file (default: ~/.lodestar/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List detected projects, workspace members folded into their roots
    Projects,
    /// Search symbols across a project
    Symbols {
        query: String,
        /// File or directory selecting the project (default: the root)
        #[arg(long, value_name = "PATH")]
        within: Option<PathBuf>,
    },
    /// Go to the definition of the symbol at a position
    Definition(PositionArgs),
    /// Find references to the symbol at a position, declaration included
    References(PositionArgs),
    /// Show hover information at a position
    Hover(PositionArgs),
    /// List the symbols declared in a file
    Outline { file: PathBuf },
    /// Show diagnostics for a file once the server settles
    Diagnostics {
        file: PathBuf,
        /// Upper bound on the wait
        #[arg(long, value_name = "SECS", default_value_t = 10)]
        wait_secs: u64,
    },
}

#[derive(Args, Debug)]
struct PositionArgs {
    file: PathBuf,
    /// Line number, 1-based
    line: u32,
    /// Column number, 1-based
    column: u32,
}

impl PositionArgs {
    /// Zero-based `(line, character)` as sent on the wire.
    fn wire_position(&self) -> (u32, u32) {
        (self.line.saturating_sub(1), self.column.saturating_sub(1))
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries results; logs must not interleave with them.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<LspConfig> {
    let config = match path {
        Some(path) => LspConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => LspConfig::load()
            .context("loading default config")?
            .unwrap_or_default(),
    };
    Ok(config.with_env_overrides())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    if !config.enabled {
        bail!("language servers are disabled in config");
    }

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let root = std::path::absolute(&root)
        .with_context(|| format!("resolving workspace root {}", root.display()))?;

    let cache = ServerCache::new(config, &root);
    let outcome = tokio::select! {
        outcome = run(&cache, &root, cli.command) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };
    cache.shutdown().await;
    outcome
}

async fn run(cache: &ServerCache, root: &Path, command: Command) -> Result<()> {
    match command {
        Command::Projects => {
            let projects = cache.projects().await;
            if projects.is_empty() {
                println!("no projects under {}", root.display());
            }
            for project in projects {
                let workspace = if project.is_workspace_root() {
                    " (workspace)"
                } else {
                    ""
                };
                println!(
                    "{:<12} {}  [{}]{workspace}",
                    project.language_id(),
                    display_relative(root, project.path()),
                    project.marker(),
                );
            }
        }
        Command::Symbols { query, within } => {
            let anchor = within.unwrap_or_else(|| root.to_path_buf());
            let client = client_for(cache, &anchor).await?;
            wait_for_index(&client).await;
            let symbols = client.workspace_symbols(&query).await?;
            print_symbols(root, &symbols);
        }
        Command::Definition(pos) => {
            let (client, uri) = open(cache, &pos.file).await?;
            let (line, character) = pos.wire_position();
            let locations = client.definition(&uri, line, character).await?;
            print_locations(root, &locations);
        }
        Command::References(pos) => {
            let (client, uri) = open(cache, &pos.file).await?;
            wait_for_index(&client).await;
            let (line, character) = pos.wire_position();
            let locations = client.references(&uri, line, character).await?;
            print_locations(root, &locations);
        }
        Command::Hover(pos) => {
            let (client, uri) = open(cache, &pos.file).await?;
            let (line, character) = pos.wire_position();
            match client.hover(&uri, line, character).await? {
                Some(hover) => println!("{}", hover.contents),
                None => println!("no hover information"),
            }
        }
        Command::Outline { file } => {
            let (client, uri) = open(cache, &file).await?;
            let symbols = client.document_symbols(&uri).await?;
            print_symbols(root, &symbols);
        }
        Command::Diagnostics { file, wait_secs } => {
            let (client, uri) = open(cache, &file).await?;
            let items = client
                .wait_for_diagnostics(&uri, Duration::from_secs(wait_secs))
                .await;
            let shown = display_relative(root, &std::path::absolute(&file)?);
            for diag in &items {
                println!("{}", diag.display_with_path(Path::new(&shown)));
            }
            if items.is_empty() {
                let note = if client.received_diagnostics() {
                    "no diagnostics"
                } else {
                    "no diagnostics received (server may still be analyzing)"
                };
                println!("{note}");
            }
        }
    }
    Ok(())
}

async fn client_for(cache: &ServerCache, path: &Path) -> Result<Arc<LspClient>> {
    let path = std::path::absolute(path)
        .with_context(|| format!("resolving {}", path.display()))?;
    match cache.client_for_file(&path).await? {
        Some(client) => Ok(client),
        None => bail!("no project found for {}", path.display()),
    }
}

/// Start the file's server and send it the file's current text.
async fn open(cache: &ServerCache, file: &Path) -> Result<(Arc<LspClient>, String)> {
    let path = std::path::absolute(file)
        .with_context(|| format!("resolving {}", file.display()))?;
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let client = client_for(cache, &path).await?;
    let uri = file_uri(&path)?;
    client.open_document(&uri, &text).await?;
    Ok((client, uri))
}

async fn wait_for_index(client: &LspClient) {
    if client.wait_for_indexing().await != IndexingOutcome::TimedOut {
        return;
    }
    match client.indexing_percentage() {
        Some(done) => tracing::warn!("Server is still indexing ({done}%); results may be incomplete"),
        None => tracing::warn!("Server is still indexing; results may be incomplete"),
    }
}

fn display_relative(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

fn location_label(root: &Path, location: &Location) -> String {
    let file = location
        .path()
        .map_or_else(|| location.uri.clone(), |p| display_relative(root, &p));
    format!(
        "{file}:{}:{}",
        location.range.start.line + 1,
        location.range.start.character + 1
    )
}

fn print_locations(root: &Path, locations: &[Location]) {
    if locations.is_empty() {
        println!("no locations");
    }
    for location in locations {
        println!("{}", location_label(root, location));
    }
}

fn print_symbols(root: &Path, symbols: &[SymbolInfo]) {
    if symbols.is_empty() {
        println!("no symbols");
    }
    for symbol in symbols {
        let name = match &symbol.container_name {
            Some(container) => format!("{container}::{}", symbol.name),
            None => symbol.name.clone(),
        };
        println!(
            "{:<14} {name}  {}",
            symbol.kind_label(),
            location_label(root, &symbol.location)
        );
    }
}
