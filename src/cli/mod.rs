//! CLI for hmcache

pub mod signal;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::find_project_root;
use crate::lock::InstanceLock;
use crate::service::Service;

#[derive(Parser)]
#[command(name = "hmcache")]
#[command(about = "Local semantic code search: per-workspace index, hybrid search over stdio")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Search query (quote multi-word queries); shorthand for `search <query>`
    query: Option<String>,

    /// Max results
    #[arg(short = 'n', long)]
    limit: Option<usize>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Show debug info (sets the log filter to debug)
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the per-workspace cache directory
    Init,
    /// Check cache/ANN/store consistency without mutating anything
    Doctor,
    /// Index the current workspace
    Index {
        /// Re-index every file, ignoring the content-hash cache
        #[arg(long)]
        force: bool,
    },
    /// Show index statistics
    Stats,
    /// Watch for changes and reindex incrementally
    Watch {
        /// Debounce interval in milliseconds
        #[arg(long, default_value = "500")]
        debounce: u64,
    },
    /// Search the index
    Search {
        query: String,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Find chunks related to a given file via the call graph and embeddings
    FindSimilar {
        file: String,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Serve search/index/ann_config/clear_cache/find_similar over JSON-RPC
    Serve {
        /// Transport type; only stdio is implemented
        #[arg(long, default_value = "stdio")]
        transport: String,
    },
    /// Inspect or adjust the ANN index configuration
    AnnConfig {
        #[command(subcommand)]
        action: AnnConfigAction,
    },
    /// Delete the workspace's cache directory
    ClearCache,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum AnnConfigAction {
    /// Print the effective ANN configuration
    Show,
    /// Print current ANN index stats (readiness, size, HNSW parameters)
    Stats,
    /// Override ef_search at runtime; persists on the next build or index
    SetEfSearch { value: usize },
    /// Force a full rebuild of the ANN index from the cache's vectors
    Rebuild,
}

pub fn run_with(cli: Cli) -> Result<()> {
    signal::setup_signal_handler();
    let root = find_project_root();

    match &cli.command {
        Some(Commands::Init) => cmd_init(&root),
        Some(Commands::Doctor) => cmd_doctor(&root),
        Some(Commands::Index { force }) => cmd_index(&root, *force, cli.quiet),
        Some(Commands::Stats) => cmd_stats(&root, cli.json),
        Some(Commands::Watch { debounce }) => cmd_watch(&root, *debounce),
        Some(Commands::Search { query, limit }) => cmd_search(&root, query, limit.or(cli.limit), cli.json),
        Some(Commands::FindSimilar { file, limit }) => {
            cmd_find_similar(&root, file, limit.or(cli.limit), cli.json)
        }
        Some(Commands::Serve { transport }) => cmd_serve(&root, transport),
        Some(Commands::AnnConfig { action }) => cmd_ann_config(&root, action),
        Some(Commands::ClearCache) => cmd_clear_cache(&root),
        Some(Commands::Completions { shell }) => {
            cmd_completions(*shell);
            Ok(())
        }
        None => match &cli.query {
            Some(q) => cmd_search(&root, q, cli.limit, cli.json),
            None => {
                println!("Usage: hmcache <query> or hmcache <command>");
                println!("Run 'hmcache --help' for more information.");
                Ok(())
            }
        },
    }
}

fn open_service(root: &std::path::Path) -> Result<Service> {
    Service::open(root).map_err(|e| anyhow::anyhow!("{e}"))
}

fn report_init_errors(service: &Service) {
    for err in service.take_init_errors() {
        tracing::warn!("{err}");
    }
}

fn cmd_init(root: &std::path::Path) -> Result<()> {
    let cache_dir = root.join(crate::CACHE_DIR);
    std::fs::create_dir_all(&cache_dir).context("creating cache directory")?;
    println!("initialized {}", cache_dir.display());
    Ok(())
}

fn cmd_doctor(root: &std::path::Path) -> Result<()> {
    let service = open_service(root)?;
    let errors = service.take_init_errors();
    if errors.is_empty() {
        println!("ok: cache and ann index are consistent");
    } else {
        println!("found {} issue(s):", errors.len());
        for err in &errors {
            println!("  - {err}");
        }
        std::process::exit(signal::ExitCode::GateFailed as i32);
    }
    Ok(())
}

fn cmd_index(root: &std::path::Path, force: bool, quiet: bool) -> Result<()> {
    let _lock = InstanceLock::acquire(&root.join(crate::CACHE_DIR)).map_err(|e| anyhow::anyhow!("{e}"))?;
    let service = open_service(root)?;
    if force {
        service.clear_cache().map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    report_init_errors(&service);
    let stats = service.index().map_err(|e| anyhow::anyhow!("{e}"))?;
    if !quiet {
        println!(
            "scanned {}, indexed {}, unchanged {}, removed {}, chunks added {}, embed failures {}{}",
            stats.files_scanned,
            stats.files_indexed,
            stats.files_unchanged,
            stats.files_removed,
            stats.chunks_added,
            stats.embed_failures,
            if stats.interrupted { " (interrupted)" } else { "" }
        );
    }
    Ok(())
}

fn cmd_stats(root: &std::path::Path, json: bool) -> Result<()> {
    let service = open_service(root)?;
    report_init_errors(&service);
    let config = service.config();
    if json {
        println!(
            "{}",
            serde_json::json!({
                "workspace": root.display().to_string(),
                "embedding_model": config.embedder.model_name,
                "embedding_dimension": config.embedder.dimension,
            })
        );
    } else {
        println!("workspace: {}", root.display());
        println!("embedding model: {}", config.embedder.model_name);
        println!("embedding dimension: {}", config.embedder.dimension);
    }
    Ok(())
}

fn cmd_watch(root: &std::path::Path, debounce_ms: u64) -> Result<()> {
    let _lock = InstanceLock::acquire(&root.join(crate::CACHE_DIR)).map_err(|e| anyhow::anyhow!("{e}"))?;
    let service = open_service(root)?;
    report_init_errors(&service);
    let watcher = crate::watcher::FileWatcher::new(root).context("starting file watcher")?;
    println!("watching {} (debounce {}ms, ctrl-c to stop)", root.display(), debounce_ms);

    loop {
        if signal::check_interrupted() {
            break;
        }
        let events = watcher.poll(std::time::Duration::from_millis(debounce_ms));
        if events.is_empty() {
            continue;
        }
        let stats = service.index().map_err(|e| anyhow::anyhow!("{e}"))?;
        println!(
            "reindexed: {} changed, {} removed, {} chunks added",
            stats.files_indexed, stats.files_removed, stats.chunks_added
        );
    }
    Ok(())
}

fn cmd_search(root: &std::path::Path, query: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let service = open_service(root)?;
    report_init_errors(&service);
    let results = service.search(query, limit).map_err(|e| anyhow::anyhow!("{e}"))?;
    print_results(&results, json);
    Ok(())
}

fn cmd_find_similar(root: &std::path::Path, file: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let service = open_service(root)?;
    report_init_errors(&service);
    let results = service
        .find_similar(file, limit)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    print_results(&results, json);
    Ok(())
}

fn print_results(results: &[crate::search::SearchResult], json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(results).unwrap_or_default());
        return;
    }
    for r in results {
        println!("{}:{}-{}  score {:.3}", r.file, r.start_line, r.end_line, r.score);
        for line in r.content.lines().take(5) {
            println!("    {line}");
        }
    }
}

fn cmd_serve(root: &std::path::Path, transport: &str) -> Result<()> {
    if transport != "stdio" {
        anyhow::bail!("unsupported transport: {transport} (only stdio is implemented)");
    }
    let _lock = InstanceLock::acquire(&root.join(crate::CACHE_DIR)).map_err(|e| anyhow::anyhow!("{e}"))?;
    let service = open_service(root)?;
    report_init_errors(&service);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    crate::protocol::serve_stdio(&service, stdin.lock(), stdout.lock())?;
    Ok(())
}

fn cmd_ann_config(root: &std::path::Path, action: &AnnConfigAction) -> Result<()> {
    let service = open_service(root)?;
    report_init_errors(&service);
    match action {
        AnnConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&service.ann_config()).unwrap_or_default());
        }
        AnnConfigAction::Stats => {
            println!("{}", serde_json::to_string_pretty(&service.ann_stats()).unwrap_or_default());
        }
        AnnConfigAction::SetEfSearch { value } => {
            service.set_ann_ef_search(*value).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&service.ann_stats()).unwrap_or_default());
        }
        AnnConfigAction::Rebuild => {
            let stats = service.rebuild_ann().map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
        }
    }
    Ok(())
}

fn cmd_clear_cache(root: &std::path::Path) -> Result<()> {
    let service = open_service(root)?;
    service.clear_cache().map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("cache cleared");
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    clap_complete::generate(shell, &mut Cli::command(), "hmcache", &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["hmcache"]).unwrap();
        assert!(cli.query.is_none());
        assert!(cli.command.is_none());
        assert!(!cli.json);
        assert!(!cli.quiet);
        assert!(!cli.verbose);
    }

    #[test]
    fn bare_query() {
        let cli = Cli::try_parse_from(["hmcache", "parse config"]).unwrap();
        assert_eq!(cli.query, Some("parse config".to_string()));
    }

    #[test]
    fn index_force_flag() {
        let cli = Cli::try_parse_from(["hmcache", "index", "--force"]).unwrap();
        match cli.command {
            Some(Commands::Index { force }) => assert!(force),
            _ => panic!("expected Index command"),
        }
    }

    #[test]
    fn search_subcommand() {
        let cli = Cli::try_parse_from(["hmcache", "search", "parse config", "-n", "3"]).unwrap();
        match cli.command {
            Some(Commands::Search { query, limit }) => {
                assert_eq!(query, "parse config");
                assert_eq!(limit, Some(3));
            }
            _ => panic!("expected Search command"),
        }
    }

    #[test]
    fn serve_default_transport_is_stdio() {
        let cli = Cli::try_parse_from(["hmcache", "serve"]).unwrap();
        match cli.command {
            Some(Commands::Serve { transport }) => assert_eq!(transport, "stdio"),
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn ann_config_set_ef_search_parses_value() {
        let cli = Cli::try_parse_from(["hmcache", "ann-config", "set-ef-search", "128"]).unwrap();
        match cli.command {
            Some(Commands::AnnConfig {
                action: AnnConfigAction::SetEfSearch { value },
            }) => assert_eq!(value, 128),
            _ => panic!("expected AnnConfig SetEfSearch command"),
        }
    }

    #[test]
    fn find_similar_requires_file_arg() {
        let result = Cli::try_parse_from(["hmcache", "find-similar"]);
        assert!(result.is_err());
    }

    #[test]
    fn exit_code_values() {
        assert_eq!(signal::ExitCode::NoResults as i32, 2);
        assert_eq!(signal::ExitCode::Interrupted as i32, 130);
    }
}
