use std::path::PathBuf;

use clap::{command, Parser};
use colored::Colorize;

use tsdb::server::{run_server, ServerConfig};
use tsdb::VERSION;

#[derive(Parser)]
#[command(author, version = VERSION, about = "TSDB REST query server", long_about = None)]
struct Cli {
    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory containing TSDB files like data_YYYY-MM-DD.tsdb
    #[arg(long, value_name = "DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Directory containing frontend assets; omit to serve the API only
    #[arg(long, value_name = "DIR")]
    ui_dir: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if !cli.data_dir.is_dir() {
        eprintln!(
            "{} data directory not found: {}",
            "error:".red().bold(),
            cli.data_dir.display()
        );
        std::process::exit(2);
    }
    if let Some(ui_dir) = &cli.ui_dir {
        if !ui_dir.is_dir() {
            eprintln!(
                "{} UI directory not found: {}",
                "error:".red().bold(),
                ui_dir.display()
            );
            std::process::exit(2);
        }
    }

    println!(
        "Serving TSDB REST API on http://{}:{} (data_dir={})",
        cli.host,
        cli.port,
        cli.data_dir.display()
    );
    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        data_dir: cli.data_dir,
        ui_dir: cli.ui_dir,
    };
    if let Err(e) = run_server(config) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(2);
    }
}
