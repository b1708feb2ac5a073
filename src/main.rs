use docucache::cli::{AnalyticsAction, CacheAction, Cli, Commands, ConfigAction, VectorAction};
use docucache::config::Config;
use docucache::embedding::create_provider;
use docucache::error::{DocCacheError, Result};
use docucache::search::{SearchFilters, SearchQuery, SearchResponse};
use docucache::service::DocumentCache;
use docucache::vector::Chunk;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Config { action } => cmd_config(cli.config, cli.profile, action),
        command => {
            let config = load_config(cli.config, cli.profile)?;
            let rt = tokio::runtime::Runtime::new().map_err(|e| DocCacheError::Io {
                source: e,
                context: "Failed to create tokio runtime".to_string(),
            })?;
            rt.block_on(run(config, command))
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "docucache=debug" } else { "docucache=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn run(config: Config, command: Commands) -> Result<()> {
    let provider = create_provider(&config.embedding)?;
    let service = DocumentCache::open(config, provider).await?;

    let outcome = match command {
        Commands::Index {
            file,
            doc_id,
            title,
            tags,
            chunk_words,
        } => cmd_index(&service, &file, doc_id, title, tags, chunk_words).await,
        Commands::Search {
            query,
            limit,
            threshold,
            tags,
            doc_ids,
            filename,
            no_content,
            json,
        } => {
            let filters = SearchFilters {
                tags: tags.into_iter().collect(),
                doc_ids: doc_ids.into_iter().collect(),
                filename,
                ..Default::default()
            };
            let mut query = SearchQuery::new(query)
                .with_filters(filters)
                .with_content(!no_content);
            query.limit = limit;
            query.similarity_threshold = threshold;
            cmd_search(&service, &query, json).await
        }
        Commands::Remove { doc_id } => cmd_remove(&service, &doc_id).await,
        Commands::Stats { json } => cmd_stats(&service, json).await,
        Commands::Analytics { action } => cmd_analytics(&service, action).await,
        Commands::Cache { action } => match action {
            CacheAction::Clear => {
                let cleared = service.clear_cache().await?;
                println!("✓ Cleared {} cached searches", cleared);
                Ok(())
            }
        },
        Commands::Vectors { action } => cmd_vectors(&service, action).await,
        Commands::Config { .. } => Ok(()),
    };

    // Let queued analytics land before the runtime goes away
    service.shutdown().await;
    outcome
}

async fn cmd_index(
    service: &DocumentCache,
    file: &Path,
    doc_id: Option<String>,
    title: Option<String>,
    tags: Vec<String>,
    chunk_words: usize,
) -> Result<()> {
    let text = std::fs::read_to_string(file).map_err(|e| DocCacheError::Io {
        source: e,
        context: format!("Failed to read {:?}", file),
    })?;

    let doc_id = doc_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let title = title.unwrap_or_else(|| filename.clone());

    let chunks: Vec<Chunk> = split_words(&text, chunk_words)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            Chunk::new(doc_id.as_str(), i as u32, piece)
                .with_tags(tags.iter().cloned())
                .with_title(title.as_str())
                .with_filename(filename.as_str())
        })
        .collect();

    if chunks.is_empty() {
        println!("Nothing to index: {} is empty", file.display());
        return Ok(());
    }

    let report = service.embed_and_index(&doc_id, &chunks).await?;

    println!("✓ Indexed {}", doc_id);
    println!("  Vectors stored: {}/{}", report.vectors_stored, chunks.len());
    if report.vectors_removed > 0 {
        println!("  Stale vectors removed: {}", report.vectors_removed);
    }
    for failure in &report.failures {
        println!("  ⚠ {}: {}", failure.chunk_id, failure.reason);
    }
    Ok(())
}

/// Word windows of at most `size` words
fn split_words(text: &str, size: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(size.max(1))
        .map(|window| window.join(" "))
        .collect()
}

async fn cmd_search(service: &DocumentCache, query: &SearchQuery, json: bool) -> Result<()> {
    let response = service.search(query).await?;

    if json {
        println!("{}", to_json(&response)?);
        return Ok(());
    }

    print_response(&response);
    Ok(())
}

fn print_response(response: &SearchResponse) {
    println!(
        "{} results for \"{}\" in {:.3}s{}",
        response.total_results,
        response.query,
        response.processing_time,
        if response.cached { " (cached)" } else { "" }
    );

    for (rank, hit) in response.results.iter().enumerate() {
        println!(
            "\n{}. [{:.3}] {} #{}",
            rank + 1,
            hit.similarity_score,
            hit.doc_id,
            hit.chunk_index
        );
        if let Some(metadata) = &hit.metadata {
            if !metadata.title.is_empty() {
                println!("   {}", metadata.title);
            }
        }
        if let Some(content) = &hit.content {
            let preview: String = content.chars().take(200).collect();
            println!("   {}", preview);
        }
    }
}

async fn cmd_remove(service: &DocumentCache, doc_id: &str) -> Result<()> {
    let report = service.remove_document(doc_id).await?;
    if report.deleted == 0 {
        println!("No vectors found for {}", doc_id);
    } else {
        println!("✓ Removed {} vectors of {}", report.deleted, doc_id);
    }
    if report.unreadable > 0 {
        println!("  ⚠ {} records could not be checked", report.unreadable);
    }
    Ok(())
}

async fn cmd_stats(service: &DocumentCache, json: bool) -> Result<()> {
    let stats = service.stats().await?;
    let snapshot = service.analytics().snapshot().await?;

    if json {
        let value = serde_json::json!({ "vectors": stats, "search": snapshot });
        println!("{}", to_json(&value)?);
        return Ok(());
    }

    println!("Docucache Statistics");
    println!("====================");
    println!("\nVectors ({} backend):", stats.backend);
    println!("  Stored: {}", stats.total_vectors);
    println!("  Created: {}", stats.vectors_created);
    println!("  Deleted: {}", stats.vectors_deleted);
    println!(
        "  Index: {} ({})",
        stats.index_name,
        if stats.index_ready { "ready" } else { "brute force" }
    );

    println!("\nSearches:");
    println!("  Total: {}", snapshot.total_searches);
    println!(
        "  Cache hits: {} ({:.1}%)",
        snapshot.cache_hits, snapshot.cache_hit_rate
    );
    println!("  Cached entries: {}", stats.cached_searches);
    println!("  Documents: {}", snapshot.total_documents);
    if snapshot.latency.samples > 0 {
        println!(
            "  Latency: avg {:.3}s, median {:.3}s, min {:.3}s, max {:.3}s",
            snapshot.latency.avg,
            snapshot.latency.median,
            snapshot.latency.min,
            snapshot.latency.max
        );
    }

    if !snapshot.popular_queries.is_empty() {
        println!("\nPopular queries:");
        for popular in &snapshot.popular_queries {
            println!("  {:>4}  {}", popular.count, popular.query);
        }
    }
    Ok(())
}

async fn cmd_analytics(service: &DocumentCache, action: AnalyticsAction) -> Result<()> {
    let analytics = service.analytics();
    match action {
        AnalyticsAction::Suggest { prefix } => {
            for suggestion in analytics.suggestions(&prefix).await? {
                println!("{}", suggestion);
            }
        }
        AnalyticsAction::History { limit } => {
            for entry in analytics.history(limit).await? {
                println!(
                    "{}  {:>3} results  {:.3}s{}  {}",
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.results,
                    entry.latency,
                    if entry.cached { " (cached)" } else { "" },
                    entry.query
                );
            }
        }
        AnalyticsAction::Hourly { hours } => {
            for usage in analytics.hourly_usage(hours).await? {
                println!(
                    "{}  searches: {:>5}  uploads: {:>5}",
                    usage.hour, usage.searches, usage.uploads
                );
            }
        }
        AnalyticsAction::Reset => {
            analytics.reset().await?;
            println!("✓ Search statistics reset");
        }
    }
    Ok(())
}

async fn cmd_vectors(service: &DocumentCache, action: VectorAction) -> Result<()> {
    match action {
        VectorAction::Info => {
            let info = service.index_info().await?;
            println!("{}", to_json(&info)?);
        }
        VectorAction::Cleanup => {
            let report = service.cleanup_corrupt_vectors().await?;
            println!("✓ Vector cleanup completed");
            println!("  Removed: {}", report.removed);
            println!("  Kept: {}", report.kept);
        }
        VectorAction::Reset { yes } => {
            if !yes {
                println!("This deletes every stored vector. Re-run with --yes to confirm.");
                return Ok(());
            }
            let deleted = service.reset_index().await?;
            println!("✓ Index reset, {} vectors deleted", deleted);
        }
    }
    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, profile)?;
            let value = serde_json::to_value(&config).map_err(|e| DocCacheError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;

            let shown = match section {
                Some(section) => value.get(&section).cloned().ok_or_else(|| {
                    DocCacheError::Config(format!("Unknown config section: {}", section))
                })?,
                None => value,
            };
            println!("{}", to_json(&shown)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DocCacheError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'docucache config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        return Ok(config);
    }

    match profile {
        Some(profile) => Config::load_with_profile(&path, &profile),
        None => Config::load(&path),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| DocCacheError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })
}
