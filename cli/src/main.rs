//! fleetssh - run commands and copy files across a fleet of hosts over SSH

use clap::{Parser, Subcommand};
use fleetssh_core::{from_fn, KeyedPool, SshConnector, SshExecutor, SshResult};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

mod config;

use config::Config;

/// fleetssh - remote execution over pooled SSH connections
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "FLEETSSH_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command on one host and print its output
    Exec {
        /// Host, optionally with `:port`
        host: String,

        /// Command line passed to the remote shell
        command: String,

        /// Deadline for the command, defaults to the configured one
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Print lines as they arrive instead of buffering
        #[arg(short, long)]
        stream: bool,
    },

    /// Check that hosts accept connections and run commands
    Validate {
        /// Hosts to probe
        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Copy local files into a remote directory
    Copy {
        /// Host, optionally with `:port`
        host: String,

        /// Local files to copy
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Remote target directory
        #[arg(short, long)]
        dir: String,

        /// Remote file mode, four octal digits
        #[arg(short, long, default_value = "0744")]
        mode: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetssh=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let executor = match build_executor(cli.config.as_deref()) {
        Ok(executor) => executor,
        Err(e) => {
            error!("Failed to start: {}", e);
            process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Exec {
            host,
            command,
            timeout_ms,
            stream,
        } => handle_exec(&executor, &host, &command, timeout_ms, stream).await,
        Commands::Validate { hosts } => handle_validate(&executor, hosts).await,
        Commands::Copy {
            host,
            files,
            dir,
            mode,
        } => handle_copy(&executor, &host, files, &dir, &mode).await,
    };

    executor.shutdown().await;

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn build_executor(config_path: Option<&str>) -> anyhow::Result<SshExecutor> {
    let config = Config::load(config_path)?;
    info!(
        username = %config.ssh.username,
        port = config.ssh.port,
        timeout_ms = config.executor.server_op_timeout_ms,
        "Loaded configuration"
    );

    let connector = Arc::new(SshConnector::new(config.ssh));
    let pool = Arc::new(KeyedPool::new(connector, config.pool));
    Ok(SshExecutor::new(pool, config.executor)?)
}

async fn handle_exec(
    executor: &SshExecutor,
    host: &str,
    command: &str,
    timeout_ms: Option<u64>,
    stream: bool,
) -> anyhow::Result<()> {
    let timeout_ms = timeout_ms.unwrap_or(executor.config().server_op_timeout_ms);

    let result = executor
        .execute(host, |session| async move {
            let result = if stream {
                let printer = from_fn(|line: &str, _| {
                    println!("{}", line);
                    Ok(())
                });
                session
                    .run_command_with_timeout(command, printer, timeout_ms)
                    .await
            } else {
                session.run_command_timeout(command, timeout_ms).await
            };
            anyhow::Ok(result)
        })
        .await?;

    print_result(result)
}

async fn handle_validate(executor: &SshExecutor, hosts: Vec<String>) -> anyhow::Result<()> {
    let mut probes = tokio::task::JoinSet::new();
    for host in hosts {
        let executor = executor.clone();
        probes.spawn(async move {
            let reachable = executor.validate(&host).await;
            (host, reachable)
        });
    }

    let mut unreachable = 0;
    while let Some(joined) = probes.join_next().await {
        let (host, reachable) = joined?;
        if reachable {
            println!("{}\tok", host);
        } else {
            println!("{}\tunreachable", host);
            unreachable += 1;
        }
    }

    if unreachable > 0 {
        anyhow::bail!("{} host(s) failed validation", unreachable)
    }
    Ok(())
}

async fn handle_copy(
    executor: &SshExecutor,
    host: &str,
    files: Vec<PathBuf>,
    remote_dir: &str,
    mode: &str,
) -> anyhow::Result<()> {
    info!("Copying {} file(s) to {}:{}", files.len(), host, remote_dir);
    let result = executor
        .execute(host, |session| async move {
            anyhow::Ok(session.copy_files(&files, None, remote_dir, mode).await)
        })
        .await?;

    print_result(result)
}

fn print_result(result: SshResult) -> anyhow::Result<()> {
    match result {
        SshResult::Success(Some(output)) => {
            println!("{}", output);
            Ok(())
        }
        SshResult::Success(None) => Ok(()),
        SshResult::Failure(cause) => Err(cause.into()),
    }
}
