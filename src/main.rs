use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use dirsync::config::{ClientConfig, ServerConfig, SyncConfig};
use dirsync::error::RetryPolicy;
use dirsync::{client, server};

#[derive(Parser)]
#[command(name = "dirsync")]
#[command(about = "Keep a directory tree identical across a server and its clients", version)]
struct Cli {
    /// TOML file with timeouts and batching settings
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory to connecting clients
    Serve {
        #[arg(short, long, env = "SERVER_PORT", default_value = "8080")]
        port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        #[arg(short, long, env = "SERVER_SYNC_DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Mirror a directory with a server
    Connect {
        #[arg(long, env = "CLIENT_REMOTE_HOST", default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, env = "CLIENT_PORT", default_value = "8080")]
        port: u16,

        #[arg(short, long, env = "CLIENT_SYNC_DIR", default_value = ".")]
        dir: PathBuf,

        /// Give up after this many failed connection attempts
        #[arg(long, default_value = "5")]
        attempts: u32,
    },
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dirsync=info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dirsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref());
    let sync = SyncConfig::load(cli.config.as_deref())?;

    let running = async {
        match cli.command {
            Commands::Serve { port, bind, dir } => {
                println!("{}", "📂 Starting dirsync server...".cyan().bold());
                println!(
                    "{} Root: {}",
                    "→".bright_blue(),
                    dir.display().to_string().bright_yellow()
                );
                println!(
                    "{} Listening on {}:{}\n",
                    "→".bright_blue(),
                    bind,
                    port.to_string().bright_yellow()
                );

                server::start(ServerConfig {
                    root: dir,
                    bind: SocketAddr::new(bind, port),
                    sync,
                })
                .await
            }

            Commands::Connect {
                host,
                port,
                dir,
                attempts,
            } => {
                println!("{}", "🔗 Starting dirsync client...".cyan().bold());
                println!(
                    "{} Root: {}",
                    "→".bright_blue(),
                    dir.display().to_string().bright_yellow()
                );
                println!(
                    "{} Server: {}:{}\n",
                    "→".bright_blue(),
                    host.bright_yellow(),
                    port
                );

                client::run(ClientConfig {
                    root: dir,
                    remote_host: host,
                    port,
                    sync,
                    retry: RetryPolicy {
                        max_attempts: attempts,
                        ..Default::default()
                    },
                })
                .await
            }
        }
    };

    tokio::select! {
        result = running => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "✓ Shutting down".green());
            Ok(())
        }
    }
}
