use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use sshhub::config::Config;
use sshhub::dispatcher::Dispatcher;
use sshhub::executor::{CommandExecutor, ExecutorConfig};
use sshhub::interactive::SessionRegistry;
use sshhub::keystore::Keystore;
use sshhub::cache::ResultCache;
use sshhub::model::ConnectOptions;
use sshhub::pool::ConnectionPool;
use sshhub::ssh::RusshConnector;
use sshhub::transfer::TransferEngine;

#[derive(Parser, Debug)]
#[command(name = "sshhub", about = "Pooled SSH multiplexing service")]
struct Cli {
    /// Path to a TOML config file. If omitted, defaults apply.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    env_logger::Builder::new().parse_filters(log_level).init();

    info!("starting sshhub with per_host_max_connections={}", config.per_host_max_connections);

    let config = Arc::new(config);
    let keystore = Arc::new(Keystore::new());
    let cache = Arc::new(ResultCache::new(config.cache_maxsize));

    let connect_options = ConnectOptions {
        known_hosts_policy: config.known_hosts_policy,
        retry_count: config.connection_retry_count,
        retry_delay: config.connection_retry_delay(),
    };
    let pool = ConnectionPool::new(Arc::new(RusshConnector::new()), config.per_host_max_connections, config.idle_connection_ttl(), connect_options);
    pool.spawn_reaper(config.idle_connection_ttl() / 2);

    let executor = Arc::new(CommandExecutor::new(
        pool.clone(),
        cache,
        keystore.clone(),
        ExecutorConfig { default_timeout: config.command_timeout(), safety_mode: config.safety_mode },
    ));

    let sessions = SessionRegistry::new(pool.clone());
    sessions.spawn_sweeper(config.idle_connection_ttl() / 2);

    let transfer = Arc::new(TransferEngine::new());

    let dispatcher = Arc::new(Dispatcher::new(executor, sessions, transfer, pool.clone(), keystore, config));

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    if let Err(e) = sshhub::rpc::serve(dispatcher, stdin, stdout).await {
        error!("rpc loop ended with error: {e}");
    }

    info!("stdin closed, shutting down pool");
    pool.shutdown().await;
}
