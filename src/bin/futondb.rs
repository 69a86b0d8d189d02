//! FutonDB Server Binary
//!
//! Command-line interface for FutonDB:
//! - Server management (serve)
//! - Database operations (create, drop, list, info)
//!
//! # Examples
//!
//! ```bash
//! # Start server
//! futondb serve --bind 0.0.0.0 --port 5984
//!
//! # Create database
//! futondb db create myapp
//!
//! # List databases
//! futondb db list
//! ```

use clap::{Args, Parser, Subcommand};
use futondb::server::{start_server, ServerConfig};
use futondb::store::{Database, MemoryEngine, StoreEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// FutonDB - a CouchDB-compatible document database server
#[derive(Parser, Debug)]
#[command(name = "futondb")]
#[command(version = futondb::VERSION)]
#[command(about = "FutonDB - a CouchDB-compatible document database server", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Data directory path
    #[arg(long, global = true, default_value = "data/futondb", env = "FUTONDB_DATA")]
    data_dir: PathBuf,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "FUTONDB_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the FutonDB server
    Serve(ServeArgs),

    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Show server version
    Version,
}

/// Server configuration arguments
#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(short, long, default_value = "127.0.0.1", env = "FUTONDB_BIND")]
    bind: String,

    /// HTTP port
    #[arg(short, long, default_value = "5984", env = "FUTONDB_PORT")]
    port: u16,

    /// Enable CORS
    #[arg(long, default_value = "true")]
    cors: bool,

    /// Maximum request body size (MB)
    #[arg(long, default_value = "10")]
    max_body_size: usize,
}

/// Database commands
#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Create a new database
    Create {
        /// Database name
        name: String,
    },

    /// Drop a database
    Drop {
        /// Database name
        name: String,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// List all databases
    List,

    /// Show database info
    Info {
        /// Database name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    match cli.command {
        Commands::Serve(args) => serve_command(cli.data_dir, args).await,
        Commands::Db { command } => db_command(cli.data_dir, command).await,
        Commands::Version => {
            println!("FutonDB {}", futondb::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "futondb.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Serve command - start the FutonDB server
async fn serve_command(data_dir: PathBuf, args: ServeArgs) -> anyhow::Result<()> {
    info!(version = %futondb::VERSION, "FutonDB starting");

    let engine: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new(data_dir.clone()));

    let server_config = ServerConfig {
        http_addr: args.bind,
        http_port: args.port,
        enable_cors: args.cors,
        max_body_size: args.max_body_size * 1024 * 1024,
        data_dir,
    };

    start_server(server_config, engine).await
}

/// Database commands
async fn db_command(data_dir: PathBuf, command: DbCommands) -> anyhow::Result<()> {
    let engine = MemoryEngine::new(data_dir);

    match command {
        DbCommands::Create { name } => {
            engine.open(&name).await?;
            println!("Created database '{}'", name);
            Ok(())
        }
        DbCommands::Drop { name, force } => {
            if !force {
                print!("Drop database '{}'? (yes/no): ", name);
                use std::io::{self, Write};
                io::stdout().flush()?;
                let mut input = String::new();
                io::stdin().read_line(&mut input)?;
                if input.trim().to_lowercase() != "yes" {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            engine.destroy(&name).await?;
            println!("Dropped database '{}'", name);
            Ok(())
        }
        DbCommands::List => {
            let dbs = engine.list_databases().await?;
            if dbs.is_empty() {
                println!("No databases.");
            } else {
                for db in dbs {
                    println!("{}", db);
                }
            }
            Ok(())
        }
        DbCommands::Info { name } => {
            let db = engine.open(&name).await?;
            let info = db.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}
