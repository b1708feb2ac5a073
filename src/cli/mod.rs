//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "docucache",
    version,
    about = "Semantic document cache with vector search",
    long_about = "Docucache splits documents into chunks, embeds them, stores the vectors in a \
                  keyed store and answers natural-language queries with the most similar chunks. \
                  Searches use the store's vector index when it has one and a brute-force scan \
                  otherwise; results are cached and every search is counted."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/docucache/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chunk, embed and index a text file
    Index {
        /// File to index
        file: PathBuf,

        /// Document id (defaults to a new UUID)
        #[arg(short, long)]
        doc_id: Option<String>,

        /// Document title (defaults to the file name)
        #[arg(short, long)]
        title: Option<String>,

        /// Tag to attach to every chunk (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Words per chunk
        #[arg(long, default_value = "200")]
        chunk_words: usize,
    },

    /// Search indexed documents
    Search {
        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long)]
        limit: Option<usize>,

        /// Minimum similarity score (0.0 - 1.0)
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Require this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Restrict to this document (repeatable)
        #[arg(long = "doc")]
        doc_ids: Vec<String>,

        /// Restrict to this file name
        #[arg(long)]
        filename: Option<String>,

        /// Omit chunk text from the output
        #[arg(long)]
        no_content: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove every vector of a document
    Remove {
        /// Document id
        doc_id: String,
    },

    /// Show vector and search statistics
    Stats {
        /// Show statistics in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Search analytics
    Analytics {
        #[command(subcommand)]
        action: AnalyticsAction,
    },

    /// Manage the search result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage the vector index
    Vectors {
        #[command(subcommand)]
        action: VectorAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum AnalyticsAction {
    /// Suggest popular queries starting with a prefix
    Suggest {
        prefix: String,
    },

    /// Show recent searches
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show searches and uploads per hour
    Hourly {
        #[arg(long, default_value = "24")]
        hours: usize,
    },

    /// Clear search statistics
    Reset,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Remove every cached search result
    Clear,
}

#[derive(Subcommand, Debug)]
pub enum VectorAction {
    /// Show index status and vector count
    Info,

    /// Delete stored vectors that can no longer be decoded
    Cleanup,

    /// Drop the index and delete every stored vector
    Reset {
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
