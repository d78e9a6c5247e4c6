//! Integration tests for the Warden core.
//!
//! These drive the fully wired core in-process - seal lifecycle, secrets,
//! policy precedence, audit tamper detection, the CA hierarchy, lease
//! lifecycle, and the agent channel over loopback TLS.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use warden_auth::AuthContext;
use warden_server::{Core, CoreConfig};

/// A wired core in a temporary data directory.
pub struct TestCore {
    pub core: Arc<Core>,
    pub root_token: String,
    _data_dir: TempDir,
}

impl TestCore {
    /// Opens, initializes (5 shares, threshold 3) and unseals a core.
    pub async fn unsealed() -> Result<Self> {
        let data_dir = TempDir::new().context("creating temp dir")?;

        let config = CoreConfig {
            data_dir: data_dir.path().to_path_buf(),
            bootstrap_addr: ([127, 0, 0, 1], 0).into(),
            session_addr: ([127, 0, 0, 1], 0).into(),
            sweep_interval: Duration::from_millis(100),
            housekeeping_interval: Duration::from_millis(200),
            ..CoreConfig::default()
        };

        let core = Arc::new(Core::open(config).await?);

        let init = core.sys_init(5, 3).await?;
        for share in init.shares.iter().take(3) {
            core.sys_unseal(&share.to_base64()).await?;
        }

        Ok(Self {
            core,
            root_token: init.root_token,
            _data_dir: data_dir,
        })
    }

    /// Admin context from the root token.
    pub async fn admin(&self) -> Result<AuthContext> {
        Ok(self.core.authenticate(&self.root_token).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use serde_json::json;
    use uuid::Uuid;

    use warden_agent::{bootstrap, AgentClient, AgentConfig, AgentNotification};
    use warden_audit::{ChainFault, ChainVerification};
    use warden_auth::RoleOptions;
    use warden_policy::{
        Capability, Decision, Policy, PolicyEffect, PolicyRule, RequestContext,
    };
    use warden_storage::records::{CertificateType, SecretType};

    fn allow_policy(name: &str, path: &str, caps: &[Capability]) -> Policy {
        Policy {
            name: name.to_string(),
            effect: PolicyEffect::Allow,
            rules: vec![PolicyRule {
                path: path.to_string(),
                capabilities: caps.iter().copied().collect::<BTreeSet<_>>(),
                conditions: Default::default(),
            }],
        }
    }

    fn deny_policy(name: &str, path: &str, caps: &[Capability]) -> Policy {
        Policy {
            effect: PolicyEffect::Deny,
            ..allow_policy(name, path, caps)
        }
    }

    // Scenario 1: init then unseal, including partial progress.
    #[tokio::test]
    async fn init_then_unseal() {
        let data_dir = TempDir::new().unwrap();
        let core = Core::open(CoreConfig {
            data_dir: data_dir.path().to_path_buf(),
            ..CoreConfig::default()
        })
        .await
        .unwrap();

        let init = core.sys_init(5, 3).await.unwrap();
        assert_eq!(init.shares.len(), 5);

        // Shares 1, 3, 5 unseal the core.
        let s = core
            .sys_unseal(&init.shares[0].to_base64())
            .await
            .unwrap();
        assert!(s.sealed);
        assert_eq!(s.progress, 1);

        core.sys_unseal(&init.shares[2].to_base64()).await.unwrap();
        let s = core
            .sys_unseal(&init.shares[4].to_base64())
            .await
            .unwrap();
        assert!(!s.sealed);
        assert_eq!(s.progress, 0);

        // Re-seal, then a single share only makes progress.
        let admin = core.authenticate(&init.root_token).await.unwrap();
        core.sys_seal(&admin).await.unwrap();

        let s = core
            .sys_unseal(&init.shares[0].to_base64())
            .await
            .unwrap();
        assert!(s.sealed);
        assert_eq!(s.progress, 1);
    }

    // Scenario 2: secret round-trip, then sealed reads fail.
    #[tokio::test]
    async fn secret_roundtrip_and_sealed() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = &fixture.core;

        let payload = json!({"user": "u", "pass": "p"});
        core.secret_write(&admin, "db/prod", &payload, SecretType::Static)
            .await
            .unwrap();

        let secret = core.secret_read(&admin, "db/prod", None).await.unwrap();
        assert_eq!(secret.data, payload);

        core.sys_seal(&admin).await.unwrap();
        assert!(core.secret_read(&admin, "db/prod", None).await.is_err());
    }

    // Scenario 3: deny precedence.
    #[tokio::test]
    async fn policy_deny_precedence() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = &fixture.core;

        core.policy_set(&admin, allow_policy("allow_all", "**", &[Capability::Read]))
            .await
            .unwrap();
        core.policy_set(
            &admin,
            deny_policy("deny_prod", "prod/**", &[Capability::Read]),
        )
        .await
        .unwrap();

        let bound = vec!["allow_all".to_string(), "deny_prod".to_string()];

        match core.policy_simulate(&bound, "prod/db", Capability::Read, &RequestContext::now()) {
            Decision::Deny { policy, .. } => assert_eq!(policy.as_deref(), Some("deny_prod")),
            other => panic!("expected deny, got {other:?}"),
        }

        match core.policy_simulate(&bound, "dev/db", Capability::Read, &RequestContext::now()) {
            Decision::Allow { policy } => assert_eq!(policy, "allow_all"),
            other => panic!("expected allow, got {other:?}"),
        }
    }

    // Scenario 4: audit tamper detection.
    #[tokio::test]
    async fn audit_tamper_detection() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = &fixture.core;

        for path in ["a/one", "a/two", "a/three"] {
            core.secret_write(&admin, path, &json!({"k": "v"}), SecretType::Static)
                .await
                .unwrap();
        }

        assert!(matches!(
            core.audit_verify_chain().await.unwrap(),
            ChainVerification::Valid { .. }
        ));

        // Flip one bit of entry 2's stored hash.
        core.storage()
            .execute(
                "UPDATE audit_entries SET current_hash = ? WHERE sequence = 2",
                &["0000000000000000000000000000000000000000000000000000000000000001"],
            )
            .await
            .unwrap();

        match core.audit_verify_chain().await.unwrap() {
            ChainVerification::Invalid { sequence, reason } => {
                assert!(
                    (sequence == 2 && reason == ChainFault::HashMismatch)
                        || (sequence == 3 && reason == ChainFault::PreviousHashMismatch),
                    "unexpected fault: seq {sequence}, {reason:?}"
                );
            }
            other => panic!("expected invalid chain, got {other:?}"),
        }
    }

    // Scenario 5: CA chain and revocation.
    #[tokio::test]
    async fn ca_chain_and_revocation() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = &fixture.core;

        let root = core
            .pki_generate_root(
                &admin,
                &warden_pki_request("warden-root", 3650),
            )
            .await
            .unwrap();
        let intermediate = core
            .pki_generate_intermediate(
                &admin,
                &warden_pki_request("warden-int", 1825),
                root.id,
            )
            .await
            .unwrap();

        // Client CSR built the way an agent builds one.
        let key = rcgen_keypair();
        let csr_pem = csr_for(&key, "client-1");
        let signed = core
            .pki_sign_csr(
                &admin,
                &csr_pem,
                intermediate.id,
                CertificateType::AppClient,
                90,
            )
            .await
            .unwrap();

        core.pki()
            .verify_peer(
                &signed.certificate_pem,
                &[intermediate.certificate_pem.clone()],
            )
            .await
            .unwrap();

        core.pki_revoke(&admin, intermediate.id, "compromised")
            .await
            .unwrap();

        let result = core
            .pki()
            .verify_peer(
                &signed.certificate_pem,
                &[intermediate.certificate_pem.clone()],
            )
            .await;
        assert!(result.is_err(), "revoked intermediate must fail the chain");
    }

    // Scenario 6: lease lifecycle with clamping and background sweep.
    #[tokio::test]
    async fn lease_lifecycle() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = &fixture.core;

        let lease = core
            .lease_issue(&admin, "db-ro", Some(chrono::Duration::seconds(60)))
            .await
            .unwrap();

        // Renewal extends, then a huge increment clamps to issued_at + max_ttl.
        let renewed = core
            .lease_renew(&admin, lease.lease_id, chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(renewed >= lease.expires_at);

        let clamped = core
            .lease_renew(&admin, lease.lease_id, chrono::Duration::seconds(600_000))
            .await
            .unwrap();
        let record = core
            .lease_list(&admin)
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.lease_id == lease.lease_id)
            .unwrap();
        assert_eq!(
            clamped,
            record.issued_at + chrono::Duration::seconds(record.max_ttl_seconds)
        );

        core.lease_revoke(&admin, lease.lease_id).await.unwrap();
        let (active, revoked) = core.lease_stats().await.unwrap();
        assert_eq!((active, revoked), (0, 1));
    }

    // The full agent path: bootstrap, mTLS session, requests, pushes.
    #[tokio::test]
    async fn agent_channel_end_to_end() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = fixture.core.clone();

        // Policy and role for the agent.
        core.policy_set(
            &admin,
            allow_policy(
                "agent_policy",
                "**",
                &[Capability::Read, Capability::Renew],
            ),
        )
        .await
        .unwrap();

        let role = core
            .auth_create_role(
                &admin,
                "edge-agents",
                RoleOptions {
                    policies: vec!["agent_policy".to_string()],
                    ..RoleOptions::default()
                },
            )
            .await
            .unwrap();
        let secret_id = core
            .auth_mint_secret_id(&admin, "edge-agents")
            .await
            .unwrap();

        core.secret_write(&admin, "app/config", &json!({"dsn": "db://x"}), SecretType::Static)
            .await
            .unwrap();

        // Serve the channel on ephemeral ports.
        let cancel = CancellationToken::new();
        let running = core.serve(cancel.clone()).await.unwrap();

        let config = AgentConfig {
            bootstrap_addr: running.bootstrap_addr.to_string(),
            session_addr: running.session_addr.to_string(),
            server_name: "localhost".to_string(),
            ca_chain_pem: running.ca_chain_pem.clone(),
            agent_id: "demo-1".to_string(),
            heartbeat_interval: Duration::from_millis(200),
            request_deadline: Duration::from_secs(5),
        };

        // Bootstrap: login + CSR.
        let identity = bootstrap(&config, &role.role_id.to_string(), Some(&secret_id))
            .await
            .unwrap();
        assert!(identity.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(identity.private_key_pem.contains("PRIVATE KEY"));

        // Established session over mTLS.
        let client = AgentClient::start(config, identity).unwrap();
        let mut notifications = client.notifications();

        // The session may take a moment to come up; heartbeat until acked.
        let mut ready = false;
        for _ in 0..50 {
            if client.heartbeat().await.is_ok() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(ready, "session never became ready");

        // secret.read
        let secret = client.read_secret("app/config", None).await.unwrap();
        assert_eq!(secret.data, json!({"dsn": "db://x"}));

        // secret.dynamic_issue + lease.renew + lease.revoke
        let lease = client.dynamic_issue("db-ro", Some(60)).await.unwrap();
        assert!(lease.credentials["username"].is_string());

        let renewed = client.renew_lease(&lease.lease_id, 60).await.unwrap();
        assert!(renewed.expires_at >= lease.expires_at);

        client.revoke_lease(&lease.lease_id).await.unwrap();

        // The owning session is told about its revoked lease.
        let notice = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match notifications.recv().await {
                    Ok(AgentNotification::LeaseRevoked(n)) => break n,
                    Ok(_) => continue,
                    Err(e) => panic!("notification stream ended: {e}"),
                }
            }
        })
        .await
        .expect("no lease.revoked push");
        assert_eq!(notice.lease_id, lease.lease_id);

        // Policy updates broadcast to sessions.
        core.policy_set(
            &admin,
            allow_policy("another", "x/**", &[Capability::Read]),
        )
        .await
        .unwrap();

        let notice = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match notifications.recv().await {
                    Ok(AgentNotification::PolicyUpdated(n)) => break n,
                    Ok(_) => continue,
                    Err(e) => panic!("notification stream ended: {e}"),
                }
            }
        })
        .await
        .expect("no policy.updated push");
        assert_eq!(notice.policy_name, "another");

        // Denied reads stay denied over the wire.
        core.policy_set(
            &admin,
            deny_policy("lockdown", "app/**", &[Capability::Read]),
        )
        .await
        .unwrap();
        // New policy binds via the role; a fresh session picks it up. For
        // this session the snapshot still allows, so only assert that the
        // audit chain stayed valid through all of the above.
        assert!(matches!(
            core.audit_verify_chain().await.unwrap(),
            ChainVerification::Valid { .. }
        ));

        client.close();
        cancel.cancel();
        running.join().await;
    }

    // Unknown-path and unauthenticated failures surface as errors, not
    // hangs, and never break the chain.
    #[tokio::test]
    async fn failure_paths_keep_chain_valid() {
        let fixture = TestCore::unsealed().await.unwrap();
        let admin = fixture.admin().await.unwrap();
        let core = &fixture.core;

        assert!(core.secret_read(&admin, "missing/path", None).await.is_err());
        assert!(core
            .auth_login(&Uuid::new_v4().to_string(), Some("ws_wrong"))
            .await
            .is_err());
        assert!(core.authenticate("wt_bogus").await.is_err());

        assert!(matches!(
            core.audit_verify_chain().await.unwrap(),
            ChainVerification::Valid { .. }
        ));
    }

    // -- helpers ----------------------------------------------------------

    fn warden_pki_request(cn: &str, days: u32) -> warden_pki::CaRequest {
        warden_pki::CaRequest {
            common_name: cn.to_string(),
            organization: "Warden Labs".to_string(),
            key_type: "ecdsa".to_string(),
            key_bits: None,
            validity_days: days,
        }
    }

    fn rcgen_keypair() -> rcgen::KeyPair {
        rcgen::KeyPair::generate().unwrap()
    }

    fn csr_for(key: &rcgen::KeyPair, cn: &str) -> String {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params
            .serialize_request(key)
            .unwrap()
            .pem()
            .unwrap()
    }
}
