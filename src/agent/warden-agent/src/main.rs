//! Warden agent binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden_agent::{bootstrap, AgentClient, AgentConfig, AgentIdentity, AgentNotification};

#[derive(Parser)]
#[command(name = "warden-agent")]
#[command(about = "Warden agent - secret delivery sidecar")]
#[command(version)]
struct Cli {
    /// Bootstrap listener address
    #[arg(long, default_value = "127.0.0.1:8220", env = "WARDEN_BOOTSTRAP_ADDR")]
    bootstrap_addr: String,

    /// Session listener address
    #[arg(long, default_value = "127.0.0.1:8221", env = "WARDEN_SESSION_ADDR")]
    session_addr: String,

    /// TLS server name presented by the core
    #[arg(long, default_value = "localhost", env = "WARDEN_SERVER_NAME")]
    server_name: String,

    /// Path to the trusted CA bundle (PEM)
    #[arg(long, env = "WARDEN_CA_FILE")]
    ca_file: PathBuf,

    /// Stable agent identifier
    #[arg(long, env = "WARDEN_AGENT_ID")]
    agent_id: String,

    /// Directory holding the agent identity (certificate + key)
    #[arg(long, default_value = ".warden-agent", env = "WARDEN_IDENTITY_DIR")]
    identity_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap: log in with AppRole and obtain a client certificate
    Bootstrap {
        /// Public role id
        #[arg(long, env = "WARDEN_ROLE_ID")]
        role_id: String,
        /// Secret id, when the role requires one
        #[arg(long, env = "WARDEN_SECRET_ID")]
        secret_id: Option<String>,
    },
    /// Connect and stream notifications until interrupted
    Run,
    /// Read a secret and print it as JSON
    Read {
        /// Secret path
        path: String,
        /// Specific version
        #[arg(long)]
        version: Option<i64>,
    },
    /// Issue a dynamic credential
    Issue {
        /// Dynamic role name
        role: String,
        /// Requested TTL in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let ca_chain_pem = std::fs::read_to_string(&cli.ca_file)
        .with_context(|| format!("reading CA bundle {}", cli.ca_file.display()))?;

    let config = AgentConfig {
        bootstrap_addr: cli.bootstrap_addr.clone(),
        session_addr: cli.session_addr.clone(),
        server_name: cli.server_name.clone(),
        ca_chain_pem,
        agent_id: cli.agent_id.clone(),
        heartbeat_interval: Duration::from_secs(30),
        request_deadline: Duration::from_secs(30),
    };

    match cli.command {
        Commands::Bootstrap { role_id, secret_id } => {
            let identity = bootstrap(&config, &role_id, secret_id.as_deref()).await?;
            save_identity(&cli.identity_dir, &identity)?;
            println!(
                "identity written to {} (certificate, key, ca chain)",
                cli.identity_dir.display()
            );
        }
        Commands::Run => {
            let identity = load_identity(&cli.identity_dir)?;
            let client = AgentClient::start(config, identity)?;
            let mut notifications = client.notifications();

            tracing::info!("Agent running; streaming notifications");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        client.close();
                        break;
                    }
                    notice = notifications.recv() => {
                        match notice {
                            Ok(AgentNotification::SecretRotated(n)) => {
                                println!("secret rotated: {} v{}", n.path, n.new_version);
                            }
                            Ok(AgentNotification::PolicyUpdated(n)) => {
                                println!("policy updated: {}", n.policy_name);
                            }
                            Ok(AgentNotification::CertExpiring(n)) => {
                                println!("certificate expiring: {} at {}", n.cert_id, n.expires_at);
                            }
                            Ok(AgentNotification::LeaseRevoked(n)) => {
                                println!("lease revoked: {} ({})", n.lease_id, n.reason);
                            }
                            Err(_) => {}
                        }
                    }
                }
            }
        }
        Commands::Read { path, version } => {
            let identity = load_identity(&cli.identity_dir)?;
            let client = AgentClient::start(config, identity)?;

            let secret = client.read_secret(&path, version).await?;
            println!("{}", serde_json::to_string_pretty(&secret.data)?);
            client.close();
        }
        Commands::Issue { role, ttl } => {
            let identity = load_identity(&cli.identity_dir)?;
            let client = AgentClient::start(config, identity)?;

            let lease = client.dynamic_issue(&role, ttl).await?;
            println!("lease {} expires at {}", lease.lease_id, lease.expires_at);
            println!("{}", serde_json::to_string_pretty(&lease.credentials)?);
            client.close();
        }
    }

    Ok(())
}

fn save_identity(dir: &Path, identity: &AgentIdentity) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("agent.crt"), &identity.certificate_pem)?;
    std::fs::write(dir.join("agent.key"), &identity.private_key_pem)?;
    std::fs::write(dir.join("ca.crt"), &identity.ca_chain_pem)?;
    Ok(())
}

fn load_identity(dir: &Path) -> Result<AgentIdentity> {
    if !dir.join("agent.crt").exists() {
        bail!(
            "no identity in {}; run `warden-agent bootstrap` first",
            dir.display()
        );
    }

    Ok(AgentIdentity {
        certificate_pem: std::fs::read_to_string(dir.join("agent.crt"))?,
        private_key_pem: std::fs::read_to_string(dir.join("agent.key"))?,
        ca_chain_pem: std::fs::read_to_string(dir.join("ca.crt"))?,
    })
}
