use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_x_loader::core::file_block_cache::cache_path_for;
use pdf_x_loader::core::{CacheFileSummary, EngineConfig, FileByteRangeCache};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Inspect the persisted byte-range caches of remote PDF documents.
#[derive(Parser)]
#[command(name = "pdf-cache-inspect", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show header, validators and cached blocks of a cache file
    Inspect {
        file: PathBuf,
        /// Print one character per block ('#' cached, '.' missing)
        #[arg(long)]
        blocks: bool,
    },
    /// Print the cache file location of a URI
    Key {
        uri: String,
        /// Cache directory (defaults to PDFX_CACHE_DIR or the user cache dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Download a remote document into its cache file
    #[cfg(feature = "http")]
    Fetch {
        uri: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    match cli.command {
        Command::Inspect { file, blocks } => match FileByteRangeCache::inspect(&file) {
            Ok(summary) => print_summary(&summary, blocks),
            Err(e) => {
                eprintln!("Error reading {}: {}", file.display(), e);
                process::exit(1);
            }
        },
        Command::Key { uri, dir } => {
            let dir = dir.unwrap_or(config.range_cache_dir);
            println!("{}", cache_path_for(&dir, &uri).display());
        }
        #[cfg(feature = "http")]
        Command::Fetch { uri, dir } => {
            let config = match dir {
                Some(dir) => config.with_range_cache_dir(dir),
                None => config,
            };
            if let Err(e) = fetch::run(&uri, &config) {
                eprintln!("Error fetching {}: {}", uri, e);
                process::exit(1);
            }
        }
    }
}

fn print_summary(summary: &CacheFileSummary, show_blocks: bool) {
    let total = summary.bitmap.len();
    let cached = summary.bitmap.count();
    let validators = &summary.validators;

    println!("File:          {}", summary.path.display());
    println!("Block size:    {} bytes", summary.block_size);
    if summary.has_identity {
        println!("Source size:   {} bytes", summary.file_size);
    } else {
        println!("Source size:   unknown (identity not established)");
    }
    println!(
        "Cached:        {}/{} blocks, {} bytes",
        cached,
        total,
        summary.cached_bytes()
    );
    println!("ETag:          {}", validators.etag.as_deref().unwrap_or("-"));
    println!(
        "Last-Modified: {}",
        validators.last_modified.as_deref().unwrap_or("-")
    );
    println!(
        "Cache-Control: {}",
        validators.cache_control.to_header_value()
    );
    match validators.fresh_until() {
        Some(until) => println!("Fresh until:   {}", until.to_rfc3339()),
        None => println!("Fresh until:   -"),
    }
    println!(
        "Stale:         {}",
        if validators.needs_revalidation(Utc::now()) {
            "yes"
        } else {
            "no"
        }
    );

    if show_blocks && total > 0 {
        let map: String = (0..total)
            .map(|block| if summary.bitmap.is_set(block) { '#' } else { '.' })
            .collect();
        for (row, line) in map.as_bytes().chunks(64).enumerate() {
            println!("{:>8}  {}", row * 64, String::from_utf8_lossy(line));
        }
    }
}

#[cfg(feature = "http")]
mod fetch {
    use pdf_x_loader::core::{
        ByteRangeCache, ChunkedSource, ChunkedSourceOptions, EngineConfig, FileByteRangeCache,
        HttpBlockFetcher, PDFResult,
    };
    use std::sync::Arc;

    pub fn run(uri: &str, config: &EngineConfig) -> PDFResult<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            let cache = Arc::new(FileByteRangeCache::for_uri(
                &config.range_cache_dir,
                uri,
                config.block_size,
                config.hot_block_capacity,
            )?);
            let path = cache.path().to_path_buf();
            let fetcher = Arc::new(HttpBlockFetcher::new(uri)?);
            let options = ChunkedSourceOptions {
                fetch_block_count: config.fetch_block_count.max(8),
                progress: Some(Arc::new(|downloaded: u64, total: Option<u64>| match total {
                    Some(total) => eprint!("\r{}/{} bytes", downloaded, total),
                    None => eprint!("\r{} bytes", downloaded),
                })),
            };
            let source = ChunkedSource::open(cache.clone() as Arc<dyn ByteRangeCache>, fetcher, options).await?;
            source.ensure_range(0, source.file_size() as usize).await?;
            eprintln!();
            println!(
                "{}: {} bytes cached in {} requests",
                path.display(),
                cache.cached_bytes(),
                source.fetch_count()
            );
            Ok(())
        })
    }
}
