//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kv_replicator::{ReplicationServer, ServerConfig, ServerEvent, Store};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tokio::sync::broadcast;

/// A server over in-memory stores, with handles to both stores
pub struct TestNode {
    pub primary: Arc<Store>,
    pub metadata: Arc<Store>,
    pub server: ReplicationServer,
}

pub fn node(config: ServerConfig) -> TestNode {
    let primary = Arc::new(Store::in_memory());
    let metadata = Arc::new(Store::in_memory());
    let server = ReplicationServer::new(primary.clone(), metadata.clone(), config).unwrap();
    TestNode {
        primary,
        metadata,
        server,
    }
}

/// Loopback config on a free port
pub fn loopback() -> ServerConfig {
    ServerConfig::new().with_host("127.0.0.1").with_port(0)
}

/// Next event matching `pred`, skipping others
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<kv_replicator::EventEnvelope>, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let envelope = rx.recv().await.unwrap();
            if pred(&envelope.event) {
                return envelope.event;
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}

/// Poll until `cond` holds
pub async fn eventually<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold in time")
}

/// A certificate authority for test bundles
pub struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// Write cert.pem, key.pem and ca.pem for a node valid for localhost
    pub fn write_bundle(&self, dir: &Path, node: &str) {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, node);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("cert.pem"), cert.pem()).unwrap();
        std::fs::write(dir.join("key.pem"), key.serialize_pem()).unwrap();
        std::fs::write(dir.join("ca.pem"), self.cert.pem()).unwrap();
    }
}
