//! kv-replicator - Binary Entry Point
//!
//! Serves a durable store under `REPLICATOR_DATA_DIR` and, when
//! `REPLICATOR_PEER` is set, pulls changes from that peer. See
//! `kv_replicator::config` for the recognized variables.

use kv_replicator::security::{CredentialBundle, SecureConnector};
use kv_replicator::{ReplicationResult, ReplicationServer, RpcClient, RuntimeOptions, ServerConfig};

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ReplicationResult<()> {
    init_tracing();

    let config = ServerConfig::from_env()?;
    let runtime = RuntimeOptions::from_env()?;
    tracing::info!(version = kv_replicator::VERSION, data_dir = %runtime.data_dir.display(), "starting");

    let pems = config.pems.clone();
    let server = ReplicationServer::open(runtime.primary_dir(), runtime.metadata_dir(), config)?;
    server.start().await?;

    if let Some(peer) = &runtime.peer {
        let mut client = RpcClient::new(peer.as_str());
        if let Some(dir) = &pems {
            client = client.with_tls(SecureConnector::new(&CredentialBundle::load(dir)?)?);
        }
        if let Some(credential) = &runtime.peer_credential {
            client = client.with_credential(credential.clone());
        }
        tracing::info!(%peer, "replicating from peer");
        server.replicate_from(client)?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server.close().await
}
