use std::env;
use std::io::{Error as IoError, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use pase_rs::eval::intersection;
use pase_rs::io::{read_bvecs, read_fvecs, read_ivecs};
use pase_rs::{IndexConfig, PaseIvfFlat, SamplingMode, SearchParams, TaskPool};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Fractions of the cluster count probed per query.
const DEFAULT_FRACTIONS: [f32; 9] = [0.01, 0.02, 0.03, 0.04, 0.05, 0.07, 0.1, 0.15, 0.25];

fn main() {
    if env::args().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        return;
    }

    let args: Vec<String> = env::args().skip(1).collect();
    let config = match Config::parse(args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            print_usage();
            process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(config) {
        eprintln!("Error: {err}");
        let mut source = err.source();
        while let Some(inner) = source {
            eprintln!("  caused by: {inner}");
            source = inner.source();
        }
        process::exit(1);
    }
}

fn run(config: Config) -> CliResult<()> {
    let settings = &config.index;
    let pool = Arc::new(TaskPool::new(settings.threads)?);
    tracing::info!(threads = pool.threads(), "worker pool ready");

    let learn = load_vectors(&config.learn, config.format, config.dim, config.max_learn)?;
    let base = load_vectors(&config.base, config.format, config.dim, config.max_base)?;
    let queries = load_vectors(&config.queries, config.format, config.dim, config.max_queries)?;
    tracing::info!(path = %config.groundtruth.display(), "loading ground truth");
    let groundtruth = read_ivecs(&config.groundtruth, config.gt_dim, config.max_queries)?;
    if groundtruth.len() < queries.len() {
        return Err(Box::new(IoError::new(
            IoErrorKind::InvalidInput,
            format!(
                "ground truth has {} rows but {} queries were loaded",
                groundtruth.len(),
                queries.len()
            ),
        )));
    }
    let ids: Vec<u32> = (0..base.len())
        .map(u32::try_from)
        .collect::<Result<_, _>>()?;

    let mut index = PaseIvfFlat::new(config.dim, settings.build.cluster_count, Arc::clone(&pool))?;
    let build_start = Instant::now();
    index.build_index(&learn, &base, &ids, &settings.build)?;
    let build_time = build_start.elapsed();

    println!(
        "Built IVF-Flat index in {:.2?} ({} vectors across {} clusters, {} centroid pages).",
        build_time,
        index.len(),
        index.centroid_count(),
        index.centroid_page_count()
    );

    let neighbour_count = settings.search.neighbour_count;
    println!("selected clusters,build time s,query time ms,R1@{neighbour_count}");
    for &fraction in &config.fractions {
        let params = SearchParams::with_cluster_fraction(
            neighbour_count,
            index.cluster_count(),
            fraction,
        );
        let (query_ms, recall) = evaluate_search(&index, &queries, &groundtruth, &params)?;
        println!(
            "{},{:.2},{:.4},{:.4}",
            params.cluster_count_to_select,
            build_time.as_secs_f64(),
            query_ms,
            recall
        );
    }

    drop(index);
    if let Ok(pool) = Arc::try_unwrap(pool) {
        pool.join();
    }
    Ok(())
}

fn load_vectors(
    path: &Path,
    format: VectorFormat,
    dim: usize,
    limit: Option<usize>,
) -> CliResult<Vec<Vec<f32>>> {
    tracing::info!(path = %path.display(), "loading vectors");
    let vectors = match format {
        VectorFormat::Fvecs => read_fvecs(path, dim, limit)?,
        VectorFormat::Bvecs => read_bvecs(path, dim, limit)?,
    };
    if vectors.is_empty() {
        return Err(Box::new(IoError::new(
            IoErrorKind::InvalidInput,
            format!("no vectors were loaded from {}", path.display()),
        )));
    }
    tracing::info!(count = vectors.len(), dim, "loaded vectors");
    Ok(vectors)
}

/// Mean query latency in milliseconds and R1@K over every query.
fn evaluate_search(
    index: &PaseIvfFlat,
    queries: &[Vec<f32>],
    groundtruth: &[Vec<u32>],
    params: &SearchParams,
) -> CliResult<(f64, f64)> {
    tracing::info!(
        queries = queries.len(),
        neighbour_count = params.neighbour_count,
        cluster_count_to_select = params.cluster_count_to_select,
        "running queries"
    );

    let mut matched = 0usize;
    let mut total_time = Duration::default();
    for (query, truth) in queries.iter().zip(groundtruth.iter()) {
        let start = Instant::now();
        let found = index.find_nearest_vector_ids(
            query,
            params.neighbour_count,
            params.cluster_count_to_select,
        )?;
        total_time += start.elapsed();
        matched += intersection(&found, truth);
    }

    let query_count = queries.len().max(1);
    let recall = matched as f64 / query_count as f64 / params.neighbour_count.max(1) as f64;
    let mean_ms = total_time.as_secs_f64() * 1000.0 / query_count as f64;
    Ok((mean_ms, recall))
}

#[derive(Debug, Clone, Copy)]
enum VectorFormat {
    Fvecs,
    Bvecs,
}

#[derive(Debug, Clone)]
struct Config {
    learn: PathBuf,
    base: PathBuf,
    queries: PathBuf,
    groundtruth: PathBuf,
    dim: usize,
    gt_dim: usize,
    format: VectorFormat,
    max_learn: Option<usize>,
    max_base: Option<usize>,
    max_queries: Option<usize>,
    fractions: Vec<f32>,
    log_level: String,
    index: IndexConfig,
}

impl Config {
    fn parse(args: Vec<String>) -> Result<Self, String> {
        let mut learn = None;
        let mut base = None;
        let mut queries = None;
        let mut groundtruth = None;
        let mut dim = None;
        let mut gt_dim = 100usize;
        let mut format = VectorFormat::Fvecs;
        let mut max_learn = None;
        let mut max_base = None;
        let mut max_queries = None;
        let mut fractions = DEFAULT_FRACTIONS.to_vec();
        let mut log_level = "info".to_string();
        let mut config_path = None;

        let mut clusters = None;
        let mut neighbours = None;
        let mut epochs = None;
        let mut tolerance = None;
        let mut sampling = None;
        let mut seed = None;
        let mut threads = None;

        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--learn" => learn = Some(next_path(&mut iter, &arg)?),
                "--base" => base = Some(next_path(&mut iter, &arg)?),
                "--queries" => queries = Some(next_path(&mut iter, &arg)?),
                "--groundtruth" => groundtruth = Some(next_path(&mut iter, &arg)?),
                "--dim" => dim = Some(next_usize(&mut iter, &arg)?),
                "--gt-dim" => gt_dim = next_usize(&mut iter, &arg)?,
                "--format" => {
                    let value = next_value(&mut iter, &arg)?;
                    format = parse_format(&value)?;
                }
                "--max-learn" => max_learn = Some(next_usize(&mut iter, &arg)?),
                "--max-base" => max_base = Some(next_usize(&mut iter, &arg)?),
                "--max-queries" => max_queries = Some(next_usize(&mut iter, &arg)?),
                "--fractions" => {
                    let value = next_value(&mut iter, &arg)?;
                    fractions = parse_fractions(&value)?;
                }
                "--log-level" => log_level = next_value(&mut iter, &arg)?,
                "--config" => config_path = Some(next_path(&mut iter, &arg)?),
                "--clusters" => clusters = Some(next_usize(&mut iter, &arg)?),
                "--neighbours" | "--top-k" => neighbours = Some(next_usize(&mut iter, &arg)?),
                "--epochs" => epochs = Some(next_usize(&mut iter, &arg)?),
                "--tolerance" => tolerance = Some(next_f32(&mut iter, &arg)?),
                "--sampling" => {
                    let value = next_value(&mut iter, &arg)?;
                    sampling = Some(parse_sampling(&value)?);
                }
                "--seed" => seed = Some(next_u64(&mut iter, &arg)?),
                "--threads" => threads = Some(next_usize(&mut iter, &arg)?),
                other => {
                    return Err(format!("unrecognised argument: {other}"));
                }
            }
        }

        let learn = learn.ok_or_else(|| "missing required argument --learn".to_string())?;
        let base = base.ok_or_else(|| "missing required argument --base".to_string())?;
        let queries = queries.ok_or_else(|| "missing required argument --queries".to_string())?;
        let groundtruth =
            groundtruth.ok_or_else(|| "missing required argument --groundtruth".to_string())?;
        let dim = dim.ok_or_else(|| "missing required argument --dim".to_string())?;

        let mut index = match config_path {
            Some(path) => IndexConfig::from_path(&path)
                .map_err(|err| format!("failed to load {}: {err}", path.display()))?,
            None => IndexConfig::default(),
        };
        if let Some(value) = clusters {
            index.build.cluster_count = value;
        }
        if let Some(value) = neighbours {
            index.search.neighbour_count = value;
        }
        if let Some(value) = epochs {
            index.build.max_epochs = value;
        }
        if let Some(value) = tolerance {
            index.build.tolerance = value;
        }
        if let Some(value) = sampling {
            index.build.sampling = value;
        }
        if let Some(value) = seed {
            index.build.seed = value;
        }
        if let Some(value) = threads {
            index.threads = value;
        }

        if dim == 0 {
            return Err("--dim must be positive".to_string());
        }
        if gt_dim == 0 {
            return Err("--gt-dim must be positive".to_string());
        }
        if index.build.cluster_count == 0 {
            return Err("--clusters must be positive".to_string());
        }
        if index.search.neighbour_count == 0 {
            return Err("--neighbours must be positive".to_string());
        }

        Ok(Self {
            learn,
            base,
            queries,
            groundtruth,
            dim,
            gt_dim,
            format,
            max_learn,
            max_base,
            max_queries,
            fractions,
            log_level,
            index,
        })
    }
}

fn next_value(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    iter.next()
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn next_path(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(next_value(iter, flag)?))
}

fn next_usize(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<usize, String> {
    let value = next_value(iter, flag)?;
    value
        .parse::<usize>()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

fn next_u64(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<u64, String> {
    let value = next_value(iter, flag)?;
    value
        .parse::<u64>()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

fn next_f32(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<f32, String> {
    let value = next_value(iter, flag)?;
    value
        .parse::<f32>()
        .map_err(|_| format!("invalid value for {flag}: {value}"))
}

fn parse_format(value: &str) -> Result<VectorFormat, String> {
    match value.to_lowercase().as_str() {
        "fvecs" => Ok(VectorFormat::Fvecs),
        "bvecs" => Ok(VectorFormat::Bvecs),
        other => Err(format!("unsupported vector format: {other}")),
    }
}

fn parse_sampling(value: &str) -> Result<SamplingMode, String> {
    match value.to_lowercase().as_str() {
        "uniform" => Ok(SamplingMode::Uniform),
        "plusplus" | "plus_plus" | "kmeans++" => Ok(SamplingMode::PlusPlus),
        other => Err(format!("unsupported sampling mode: {other}")),
    }
}

fn parse_fractions(value: &str) -> Result<Vec<f32>, String> {
    let fractions = value
        .split(',')
        .map(|part| {
            let part = part.trim();
            match part.parse::<f32>() {
                Ok(fraction) if fraction > 0.0 && fraction <= 1.0 => Ok(fraction),
                _ => Err(format!("invalid cluster fraction: {part}")),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    if fractions.is_empty() {
        return Err("--fractions must list at least one value".to_string());
    }
    Ok(fractions)
}

fn print_usage() {
    eprintln!("Usage: cargo run --release --bin pase_ivfflat -- [OPTIONS]");
    eprintln!("\nRequired arguments:");
    eprintln!("    --learn <path>        Training vectors (.fvecs or .bvecs)");
    eprintln!("    --base <path>         Base vectors to index");
    eprintln!("    --queries <path>      Query vectors");
    eprintln!("    --groundtruth <path>  Ground truth ids (.ivecs)");
    eprintln!("    --dim <value>         Vector dimension");
    eprintln!("\nOptional arguments:");
    eprintln!("    --config <path>       TOML settings file; flags override its values");
    eprintln!("    --format <fvecs|bvecs> Vector file format (default: fvecs)");
    eprintln!("    --gt-dim <value>      Ids per ground truth row (default: 100)");
    eprintln!("    --clusters <value>    Cluster count (default: 100)");
    eprintln!("    --neighbours <value>  Neighbours per query (default: 100)");
    eprintln!("    --epochs <value>      Maximum k-means epochs (default: 100)");
    eprintln!("    --tolerance <value>   k-means convergence tolerance (default: 1e-4)");
    eprintln!("    --sampling <uniform|plusplus> Centroid seeding (default: plusplus)");
    eprintln!("    --seed <value>        Random seed for clustering");
    eprintln!("    --threads <value>     Worker threads, 0 for all cores (default: 0)");
    eprintln!("    --fractions <list>    Comma-separated fractions of clusters to probe");
    eprintln!("    --max-learn <value>   Limit the number of training vectors loaded");
    eprintln!("    --max-base <value>    Limit the number of base vectors loaded");
    eprintln!("    --max-queries <value> Limit the number of query vectors loaded");
    eprintln!("    --log-level <filter>  Log filter when RUST_LOG is unset (default: info)");
}
