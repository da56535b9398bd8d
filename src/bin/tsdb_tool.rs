use std::path::{Path, PathBuf};

use clap::{command, Parser, Subcommand};
use colored::Colorize;

use tsdb::collect::{run_collector, CollectorOptions};
use tsdb::compress::compress_tsdb_file;
use tsdb::config::load_collector_config;
use tsdb::demo::generate_demo_data;
use tsdb::error::TsdbResult;
use tsdb::reader::{dump_tsdb_file, read_tsdb_file};
use tsdb::VERSION;

#[derive(Parser)]
#[command(author, version = VERSION, about = "Tools for working with TSDB log files", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the TSDB files; relative file arguments resolve
    /// against it
    #[arg(long, value_name = "DIR", default_value = ".")]
    data_dir: PathBuf,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump a TSDB file in human-readable form
    Dump {
        /// The file to dump
        #[arg(value_name = "DBFILE")]
        file: PathBuf,
    },
    /// Generate demo TSDB files for the given number of days
    GenerateDemoDb {
        #[arg(value_name = "DAYS")]
        days: u32,

        /// Optional name=value series list driving the generator
        #[arg(long, value_name = "FILE")]
        series_file: Option<PathBuf>,
    },
    /// Compress a TSDB file in place
    Compress {
        #[arg(value_name = "DBFILE")]
        file: PathBuf,
    },
    /// Poll configured HTTP sources into daily TSDB files
    Collect {
        /// Path to the collector config file
        #[arg(long, value_name = "FILE", default_value = "collector.toml")]
        config: PathBuf,

        /// Quantize timestamps to this many milliseconds (0 disables)
        #[arg(long, value_name = "MS")]
        quantize_timestamps: Option<u64>,
    },
}

fn resolve_tsdb_path(data_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir.join(path)
    }
}

fn compress_in_place(path: &Path, verbose: u8) -> TsdbResult<()> {
    let old_size = std::fs::metadata(path)?.len();
    let temp_path = path.with_extension("tsdb.compress.tmp");
    match compress_tsdb_file(path, &temp_path) {
        Ok(_) => {}
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    }
    let new_size = std::fs::metadata(&temp_path)?.len();
    std::fs::rename(&temp_path, path)?;
    if verbose > 0 {
        let gained = old_size as i64 - new_size as i64;
        let gained_pct = if old_size > 0 {
            gained as f64 / old_size as f64 * 100.0
        } else {
            0.0
        };
        println!("old_size={old_size} new_size={new_size} gained={gained_pct:.2}%");
    }
    Ok(())
}

fn run(cli: Cli) -> TsdbResult<()> {
    match cli.command {
        Commands::Dump { file } => {
            let path = resolve_tsdb_path(&cli.data_dir, &file);
            if cli.verbose > 0 {
                dump_tsdb_file(&path, &mut std::io::stdout().lock(), cli.verbose)?;
            } else {
                let db = read_tsdb_file(&path)?;
                db.dump(&mut std::io::stdout().lock())?;
            }
            Ok(())
        }
        Commands::GenerateDemoDb { days, series_file } => {
            let paths = generate_demo_data(days, &cli.data_dir, series_file.as_deref())?;
            for path in paths {
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::Compress { file } => {
            let path = resolve_tsdb_path(&cli.data_dir, &file);
            compress_in_place(&path, cli.verbose)
        }
        Commands::Collect {
            config,
            quantize_timestamps,
        } => {
            let loaded = load_collector_config(&config)?;
            let data_dir = match (&cli.data_dir, &loaded.data_dir) {
                // An explicit --data-dir wins over the config file.
                (dir, Some(from_config)) if dir.as_os_str() == "." => PathBuf::from(from_config),
                (dir, _) => dir.clone(),
            };
            let quantize_ms = quantize_timestamps
                .or(loaded.quantize_timestamps)
                .unwrap_or(0);
            run_collector(CollectorOptions {
                config: loaded,
                data_dir,
                quantize_ms,
            })
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(2);
    }
}
