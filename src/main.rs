use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use btc_stratum_proxy::config::Config;
use btc_stratum_proxy::session_manager;

#[derive(Debug, Parser)]
#[command(name = "btc-stratum-proxy", about = "Stratum mining proxy for BTC ASICs")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long, default_value = "config.json")]
    config: PathBuf,

    /// Directory to write a rolling log file into; console logging always happens regardless.
    #[arg(short = 'l', long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _file_guard = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "btc-stratum-proxy.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
            None
        }
    };

    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        tracing::warn!("{} not found, starting with defaults", cli.config.display());
        Config::default()
    };
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!("----------------------------------");
    tracing::info!("starting btc-stratum-proxy");
    tracing::info!("  listen:            {}:{}", config.agent_listen_ip, config.agent_listen_port);
    tracing::info!("  multi-user mode:   {}", config.multi_user_mode);
    tracing::info!("  always keep down:  {}", config.always_keep_downconn);
    tracing::info!("  pools:             {}", config.pools.len());
    tracing::info!("  pool tls:          {}", config.pool_use_tls);
    tracing::info!("----------------------------------");

    let run_config = config.clone();
    let server = tokio::spawn(async move { session_manager::run(run_config).await });

    tokio::select! {
        result = server => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}
