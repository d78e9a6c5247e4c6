//! Warden server - main entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden_server::{Core, CoreConfig};

#[derive(Parser)]
#[command(name = "warden-server")]
#[command(about = "Warden - machine-to-machine secrets platform core")]
#[command(version)]
struct Cli {
    /// Data directory
    #[arg(long, default_value = "./data", env = "WARDEN_DATA_DIR")]
    data_dir: PathBuf,

    /// Bootstrap listener address
    #[arg(long, default_value = "127.0.0.1:8220", env = "WARDEN_BOOTSTRAP_ADDR")]
    bootstrap: SocketAddr,

    /// mTLS session listener address
    #[arg(long, default_value = "127.0.0.1:8221", env = "WARDEN_SESSION_ADDR")]
    session: SocketAddr,

    /// TLS server name on the core's certificate
    #[arg(long, default_value = "localhost", env = "WARDEN_SERVER_NAME")]
    server_name: String,

    /// Lease sweeper interval, seconds
    #[arg(long, default_value = "5", env = "WARDEN_SWEEP_INTERVAL")]
    sweep_interval: u64,

    /// Retention window for deleted secrets, days
    #[arg(long, default_value = "90", env = "WARDEN_SECRET_RETENTION_DAYS")]
    secret_retention_days: i64,

    /// Remaining validity that triggers cert.expiring pushes, days
    #[arg(long, default_value = "14", env = "WARDEN_CERT_EXPIRY_WINDOW_DAYS")]
    cert_expiry_window_days: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting Warden core...");

    let config = CoreConfig {
        data_dir: cli.data_dir,
        bootstrap_addr: cli.bootstrap,
        session_addr: cli.session,
        server_name: cli.server_name,
        sweep_interval: Duration::from_secs(cli.sweep_interval),
        secret_retention: chrono::Duration::days(cli.secret_retention_days),
        cert_expiry_window: chrono::Duration::days(cli.cert_expiry_window_days),
        ..CoreConfig::default()
    };

    let core = Arc::new(Core::open(config).await?);

    let status = core.sys_status().await;
    if !status.initialized {
        tracing::warn!("Core is uninitialized - run sys.init and distribute the shares");
    } else if status.sealed {
        tracing::warn!(
            threshold = status.threshold,
            "Core is sealed - submit {} shares to unseal",
            status.threshold
        );
    }

    // The channel can only come up once the core is unsealed; poll until
    // then, since unsealing arrives through the admin surface.
    let cancel = CancellationToken::new();
    let running = loop {
        if !core.sys_status().await.sealed {
            break core.serve(cancel.clone()).await?;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down before unseal");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    };

    tracing::info!(
        bootstrap = %running.bootstrap_addr,
        session = %running.session_addr,
        "Warden core serving"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    cancel.cancel();
    running.join().await;

    tracing::info!("Shutdown complete");

    Ok(())
}
