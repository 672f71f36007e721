//! CLI entry point for the disk-resident vector index.
//!
//! Provides commands for ingesting vectors, building the graph index and
//! querying it. Main components: Cli parser, Commands enum and one handler
//! per command.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use pqgraph::display::{
    ProgressStack, THEME, Theme, create_build_table, create_search_table, format_bytes,
    with_spinner,
};
use pqgraph::vector::{read_fvecs, vectors_path};
use pqgraph::{
    ErrorContext, IndexBuilder, IndexError, IndexReader, InMemoryVectors, RawVectorWriter,
    Settings, VectorDimension, VectorReader, VertexIndex, logging,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Serialize)]
struct SearchHit {
    vertex: VertexIndex,
    distance: f32,
}

#[derive(Debug, Serialize)]
struct SearchOutput {
    index: String,
    k: usize,
    elapsed_us: u128,
    results: Vec<SearchHit>,
}

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Disk-resident vector index
#[derive(Parser)]
#[command(
    name = "pqgraph",
    version = env!("CARGO_PKG_VERSION"),
    about = "Disk-resident approximate nearest-neighbor index",
    long_about = "Ingest vectors, build a product-quantized proximity graph on disk and query it.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Quick Start:\n  $ pqgraph init\n  $ pqgraph ingest docs --input base.fvecs\n  $ pqgraph build docs --dimension 128 --progress\n  $ pqgraph search docs --dimension 128 --query-file query.fvecs -k 10"
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Initialize project
    #[command(about = "Set up .pqgraph directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .pqgraph/settings.toml")]
    Config,

    /// Append vectors to the raw vector file of an index
    #[command(about = "Append vectors from an .fvecs file or random vectors")]
    Ingest {
        /// Index name
        name: String,

        /// Input file in .fvecs format
        #[arg(short, long, conflicts_with = "random")]
        input: Option<PathBuf>,

        /// Generate this many uniform random vectors instead
        #[arg(long, requires = "dimension")]
        random: Option<usize>,

        /// Vector dimension (checked against the input file)
        #[arg(short, long)]
        dimension: Option<usize>,

        /// Seed for random vectors
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Build the graph index from ingested vectors
    #[command(about = "Build the on-disk graph index")]
    Build {
        /// Index name
        name: String,

        /// Vector dimension
        #[arg(short, long)]
        dimension: usize,

        /// Number of threads to use (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Partition memory budget in bytes (overrides config)
        #[arg(long)]
        memory_budget: Option<u64>,

        /// Directory for partition scratch files
        #[arg(long)]
        scratch_dir: Option<PathBuf>,

        /// Show progress during the build
        #[arg(short, long)]
        progress: bool,
    },

    /// Query the index
    #[command(about = "Find approximate nearest neighbors of a query vector")]
    Search {
        /// Index name
        name: String,

        /// Vector dimension
        #[arg(short, long)]
        dimension: usize,

        /// Comma-separated query vector
        #[arg(short, long, conflicts_with = "query_file")]
        query: Option<String>,

        /// .fvecs file whose first vector is the query
        #[arg(long)]
        query_file: Option<PathBuf>,

        /// Number of neighbors
        #[arg(short, default_value_t = 10)]
        k: usize,

        /// Output JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Measure recall against an exact scan
    #[command(about = "Compare nearest against brute force on sampled queries")]
    Recall {
        /// Index name
        name: String,

        /// Vector dimension
        #[arg(short, long)]
        dimension: usize,

        /// Query vectors in .fvecs format
        #[arg(long)]
        queries: PathBuf,

        /// Number of neighbors
        #[arg(short, default_value_t = 10)]
        k: usize,

        /// Maximum number of queries to evaluate
        #[arg(long, default_value_t = 100)]
        sample: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path).unwrap_or_else(|e| {
            eprintln!(
                "{}",
                THEME.error_with_icon(&format!(
                    "Configuration error loading from {}: {e}",
                    path.display()
                ))
            );
            std::process::exit(1);
        }),
        None => Settings::load().unwrap_or_else(|e| {
            eprintln!("{}", THEME.warning_with_icon(&format!("Configuration error: {e}")));
            Settings::default()
        }),
    };

    logging::init(cli.debug || settings.debug);

    let outcome = match cli.command {
        Commands::Init { force } => {
            run_init(force);
            Ok(())
        }
        Commands::Config => {
            run_config(&settings);
            Ok(())
        }
        Commands::Ingest {
            name,
            input,
            random,
            dimension,
            seed,
        } => run_ingest(&settings, &name, input, random, dimension, seed),
        Commands::Build {
            name,
            dimension,
            threads,
            memory_budget,
            scratch_dir,
            progress,
        } => {
            if let Some(threads) = threads {
                settings.build.parallel_threads = threads;
            }
            if let Some(budget) = memory_budget {
                settings.build.memory_budget_bytes = budget;
            }
            run_build(&settings, &name, dimension, scratch_dir, progress)
        }
        Commands::Search {
            name,
            dimension,
            query,
            query_file,
            k,
            json,
        } => run_search(&settings, &name, dimension, query, query_file, k, json),
        Commands::Recall {
            name,
            dimension,
            queries,
            k,
            sample,
        } => run_recall(&settings, &name, dimension, &queries, k, sample),
    };

    if let Err(error) = outcome {
        exit_with(&error);
    }
}

/// Prints the error with its recovery suggestions and exits.
fn exit_with(error: &IndexError) -> ! {
    eprintln!("{}", THEME.error_with_icon(&error.to_string()));
    for suggestion in error.recovery_suggestions() {
        eprintln!(
            "  {}",
            THEME.apply(&THEME.dim, format!("Suggestion: {suggestion}"))
        );
    }
    eprintln!(
        "  {}",
        THEME.apply(&THEME.dim, format!("Status: {}", error.status_code()))
    );
    std::process::exit(1);
}

fn run_init(force: bool) {
    match Settings::init_config_file(".", force) {
        Ok(path) => {
            println!(
                "{}",
                THEME.success_with_icon(&format!(
                    "Created configuration file at: {}",
                    path.display()
                ))
            );
            println!("Edit this file to customize your settings.");
        }
        Err(e) => {
            eprintln!("{}", THEME.error_with_icon(&e.to_string()));
            std::process::exit(1);
        }
    }
}

fn run_config(settings: &Settings) {
    if Theme::should_disable_colors() {
        println!("Current Configuration:");
    } else {
        println!("{}", THEME.header.apply_to("Current Configuration:"));
    }
    println!("{}", "=".repeat(50));
    match toml::to_string_pretty(settings) {
        Ok(toml_str) => println!("{toml_str}"),
        Err(e) => eprintln!("Error displaying config: {e}"),
    }
}

fn run_ingest(
    settings: &Settings,
    name: &str,
    input: Option<PathBuf>,
    random: Option<usize>,
    dimension: Option<usize>,
    seed: u64,
) -> Result<(), IndexError> {
    let vectors = match (input, random, dimension) {
        (Some(path), _, expected) => {
            let vectors = read_fvecs(&path)?;
            if let Some(expected) = expected.filter(|&d| d != vectors.dimensions()) {
                return Err(IndexError::InvalidConfiguration {
                    reason: format!(
                        "{} holds {}-dimensional vectors, expected {expected}",
                        path.display(),
                        vectors.dimensions()
                    ),
                });
            }
            vectors
        }
        (None, Some(count), Some(dimension)) => random_vectors(count, dimension, seed)?,
        _ => {
            return Err(IndexError::InvalidConfiguration {
                reason: "ingest needs --input or --random with --dimension".to_string(),
            });
        }
    };

    let dimension = VectorDimension::new(vectors.dimensions())?;
    let mut writer = RawVectorWriter::open(
        &settings.index_path,
        name,
        dimension,
        settings.distance.search_function(),
    )?;
    writer.append_all((0..vectors.size()).map(|i| vectors.read(i)))?;
    let total = writer.vector_count();
    let path = writer.finish()?;

    println!(
        "{}",
        THEME.success_with_icon(&format!(
            "Appended {} vectors ({total} total) to {}",
            vectors.size(),
            path.display()
        ))
    );
    Ok(())
}

fn random_vectors(
    count: usize,
    dimension: usize,
    seed: u64,
) -> Result<InMemoryVectors, IndexError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut vectors = InMemoryVectors::new(VectorDimension::new(dimension)?);
    let mut row = vec![0.0f32; dimension];
    for _ in 0..count {
        row.iter_mut().for_each(|x| *x = rng.random_range(-1.0..1.0));
        vectors.push(&row)?;
    }
    Ok(vectors)
}

fn run_build(
    settings: &Settings,
    name: &str,
    dimension: usize,
    scratch_dir: Option<PathBuf>,
    progress: bool,
) -> Result<(), IndexError> {
    let mut params = settings.build_params(name, dimension);
    params.scratch_dir = scratch_dir;

    let raw = vectors_path(&params.index_dir, name);
    if let Ok(meta) = std::fs::metadata(&raw) {
        eprintln!(
            "Building '{name}' from {} of vectors with {} threads",
            THEME.bytes(meta.len()),
            params.parallel_threads
        );
    }

    let stack = if progress {
        ProgressStack::new()
    } else {
        ProgressStack::disabled()
    };
    let report = IndexBuilder::new(params).build(&stack)?;

    if report.vertex_count == 0 {
        println!("{}", THEME.warning_with_icon("No vectors to index"));
        return Ok(());
    }
    println!("{}", create_build_table(&report));
    println!("{}", THEME.success_with_icon("Index built"));
    Ok(())
}

fn parse_query(text: &str) -> Result<Vec<f32>, IndexError> {
    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| IndexError::InvalidConfiguration {
                    reason: format!("invalid query component '{part}': {e}"),
                })
        })
        .collect()
}

fn run_search(
    settings: &Settings,
    name: &str,
    dimension: usize,
    query: Option<String>,
    query_file: Option<PathBuf>,
    k: usize,
    json: bool,
) -> Result<(), IndexError> {
    let query = match (query, query_file) {
        (Some(text), _) => parse_query(&text)?,
        (None, Some(path)) => read_fvecs(&path)?.read(0).to_vec(),
        (None, None) => {
            return Err(IndexError::InvalidConfiguration {
                reason: "search needs --query or --query-file".to_string(),
            });
        }
    };

    let reader = IndexReader::open(settings.reader_params(name, dimension))?;
    let started = Instant::now();
    let mut ids = Vec::with_capacity(k);
    reader.nearest(&query, &mut ids, k)?;
    let elapsed = started.elapsed();

    let mut results = Vec::with_capacity(ids.len());
    for &vertex in &ids {
        results.push(SearchHit {
            vertex,
            distance: reader.exact_distance(&query, vertex)?,
        });
    }

    if json {
        let output = SearchOutput {
            index: name.to_string(),
            k,
            elapsed_us: elapsed.as_micros(),
            results,
        };
        let text = serde_json::to_string_pretty(&output).context("JSON output failed")?;
        println!("{text}");
    } else {
        let rows: Vec<(VertexIndex, f32)> =
            results.iter().map(|h| (h.vertex, h.distance)).collect();
        println!("{}", create_search_table(&rows, None));
        eprintln!("Search took {elapsed:.2?}");
    }
    Ok(())
}

fn run_recall(
    settings: &Settings,
    name: &str,
    dimension: usize,
    queries: &Path,
    k: usize,
    sample: usize,
) -> Result<(), IndexError> {
    let queries = read_fvecs(queries)?;
    let reader = IndexReader::open(settings.reader_params(name, dimension))?;
    let count = queries.size().min(sample);

    let started = Instant::now();
    let (found, expected) = with_spinner(&format!("Measuring recall on {count} queries"), || {
        let mut found = 0usize;
        let mut expected = 0usize;
        let mut ids = Vec::with_capacity(k);
        for i in 0..count {
            let query = queries.read(i);
            reader.nearest(query, &mut ids, k)?;
            let exact: HashSet<VertexIndex> =
                reader.exact_nearest(query, k)?.into_iter().collect();
            found += ids.iter().filter(|id| exact.contains(id)).count();
            expected += exact.len();
        }
        Ok::<_, IndexError>((found, expected))
    })?;

    let recall = if expected == 0 {
        1.0
    } else {
        found as f64 / expected as f64
    };
    println!("{}", create_search_table(&[], Some(recall)));
    if let Some(stats) = reader.cache_stats() {
        eprintln!(
            "{count} queries in {:.2?}; cache hits {}, misses {}, budget {}",
            started.elapsed(),
            stats.hits,
            stats.misses,
            format_bytes(settings.search.cache_bytes)
        );
    }
    Ok(())
}
