//! Mutual TLS between replication servers

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kv_replicator::replication::CycleOutcome;
use kv_replicator::config::IdentifyFn;
use kv_replicator::security::{CredentialBundle, SecureChannelGate, SecureConnector};
use kv_replicator::ReplicationError;
use kv_replicator::{KvStore, PeerIdentity, RpcClient, ServerConfig, ServerEvent};
use serde_json::json;
use tempfile::TempDir;

use common::{loopback, node, wait_for, TestCa};

fn connector(dir: &std::path::Path) -> SecureConnector {
    SecureConnector::new(&CredentialBundle::load(dir).unwrap()).unwrap()
}

#[tokio::test]
async fn test_mutual_tls_replication() {
    let temp_dir = TempDir::new().unwrap();
    let ca = TestCa::new("replication test ca");
    let server_pems = temp_dir.path().join("server");
    let client_pems = temp_dir.path().join("client");
    ca.write_bundle(&server_pems, "server");
    ca.write_bundle(&client_pems, "client");

    let expected = CredentialBundle::load(&client_pems)
        .unwrap()
        .own_fingerprint()
        .unwrap();
    let identify_expected = expected.clone();
    let source = node(
        loopback()
            .with_pems(&server_pems)
            .with_identify(move |peer: &PeerIdentity| {
                peer.fingerprint.as_deref() == Some(identify_expected.as_str())
            }),
    );
    let addr = source.server.start().await.unwrap().unwrap();
    source.primary.put("secret", json!("value")).unwrap();
    let mut rx = source.server.events().subscribe();

    let target = node(ServerConfig::new().skip_listen());
    target.server.start().await.unwrap();
    let peer = RpcClient::new(format!("localhost:{}", addr.port()))
        .with_name("source")
        .with_tls(connector(&client_pems));

    let outcome = target.server.driver().run_cycle(&peer).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Applied { applied: 1, .. }));
    assert_eq!(target.primary.get("secret").unwrap(), Some(json!("value")));

    match wait_for(&mut rx, |e| matches!(e, ServerEvent::Identified { .. })).await {
        ServerEvent::Identified { peer } => {
            assert_eq!(peer.fingerprint.as_deref(), Some(expected.as_str()));
        }
        other => panic!("unexpected event {:?}", other),
    }

    source.server.close().await.unwrap();
    target.server.close().await.unwrap();
}

#[tokio::test]
async fn test_ip_address_server_name() {
    let temp_dir = TempDir::new().unwrap();
    let ca = TestCa::new("ip test ca");
    ca.write_bundle(&temp_dir.path().join("server"), "server");
    ca.write_bundle(&temp_dir.path().join("client"), "client");

    let source = node(
        loopback()
            .with_pems(temp_dir.path().join("server"))
            .with_identify(|_| true),
    );
    let addr = source.server.start().await.unwrap().unwrap();

    let client = RpcClient::new(addr.to_string()).with_tls(connector(&temp_dir.path().join("client")));
    client.ping().await.unwrap();
    assert_eq!(client.version().await.unwrap(), kv_replicator::VERSION);

    source.server.close().await.unwrap();
}

#[tokio::test]
async fn test_identify_refusal_closes_connection() {
    let temp_dir = TempDir::new().unwrap();
    let ca = TestCa::new("refusal test ca");
    ca.write_bundle(&temp_dir.path().join("server"), "server");
    ca.write_bundle(&temp_dir.path().join("client"), "client");

    let asked = Arc::new(AtomicBool::new(false));
    let asked_in_identify = asked.clone();
    let source = node(
        loopback()
            .with_pems(temp_dir.path().join("server"))
            .with_identify(move |_| {
                asked_in_identify.store(true, Ordering::SeqCst);
                false
            }),
    );
    let addr = source.server.start().await.unwrap().unwrap();
    let mut rx = source.server.events().subscribe();

    let client = RpcClient::new(addr.to_string()).with_tls(connector(&temp_dir.path().join("client")));
    assert!(client.fetch("a").await.is_err());

    match wait_for(&mut rx, |e| matches!(e, ServerEvent::Rejected { .. })).await {
        ServerEvent::Rejected { reason, .. } => assert!(reason.contains("identify")),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(asked.load(Ordering::SeqCst));

    source.server.close().await.unwrap();
}

#[tokio::test]
async fn test_untrusted_client_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let ca = TestCa::new("trusted ca");
    let rogue = TestCa::new("rogue ca");
    ca.write_bundle(&temp_dir.path().join("server"), "server");
    rogue.write_bundle(&temp_dir.path().join("rogue"), "rogue");
    // Trusts the server but presents a certificate from another CA
    std::fs::copy(
        temp_dir.path().join("server").join("ca.pem"),
        temp_dir.path().join("rogue").join("ca.pem"),
    )
    .unwrap();

    let source = node(
        loopback()
            .with_pems(temp_dir.path().join("server"))
            .with_identify(|_| true),
    );
    let addr = source.server.start().await.unwrap().unwrap();
    let mut rx = source.server.events().subscribe();

    let client = RpcClient::new(addr.to_string()).with_tls(connector(&temp_dir.path().join("rogue")));
    assert!(client.ping().await.is_err());
    wait_for(&mut rx, |e| matches!(e, ServerEvent::Rejected { .. })).await;

    source.server.close().await.unwrap();
}

#[tokio::test]
async fn test_plain_client_cannot_talk_to_secure_server() {
    let temp_dir = TempDir::new().unwrap();
    let ca = TestCa::new("plain test ca");
    ca.write_bundle(temp_dir.path(), "server");

    let source = node(loopback().with_pems(temp_dir.path()).with_identify(|_| true));
    let addr = source.server.start().await.unwrap().unwrap();

    let client = RpcClient::new(addr.to_string());
    assert!(client.ping().await.is_err());

    source.server.close().await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_times_out_in_handshake() {
    let temp_dir = TempDir::new().unwrap();
    let ca = TestCa::new("silent test ca");
    ca.write_bundle(temp_dir.path(), "server");

    let identify: IdentifyFn = Arc::new(|_: &PeerIdentity| true);
    let gate = SecureChannelGate::new(&CredentialBundle::load(temp_dir.path()).unwrap(), identify)
        .unwrap()
        .with_handshake_timeout(Duration::from_millis(100));

    // Connected but never speaks
    let (_client, server_side) = tokio::io::duplex(4096);
    let result = tokio::time::timeout(Duration::from_secs(5), gate.accept(server_side))
        .await
        .expect("gate must give up on its own");
    match result {
        Err(ReplicationError::Tls(message)) => assert!(message.contains("timed out")),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("handshake cannot succeed without a client"),
    }
}
