//! # Warden Agent
//!
//! Channel client for agent processes.
//!
//! First run: [`bootstrap`] performs AppRole login over the
//! server-authenticated listener, generates a key pair locally, submits a
//! CSR and receives the signed client certificate plus the CA chain. The
//! private key never leaves the agent.
//!
//! Thereafter: [`AgentClient`] keeps a mutually authenticated session
//! open, heartbeats every 30 seconds, matches responses to requests by
//! correlation reference, surfaces server pushes, and reconnects with
//! jittered exponential backoff (1 s doubling to 60 s, reset on success)
//! using the same identity.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_session::proto::{
    kinds, Ack, CertExpiringNotice, CertRequest, CertResponse, DynamicIssueRequest,
    DynamicIssueResponse, Frame, LeaseRenewRequest, LeaseRenewResponse, LeaseRevokeRequest,
    LeaseRevokedNotice, LoginRequest, LoginResponse, PolicyUpdatedNotice, SecretReadRequest,
    SecretReadResponse, SecretRotatedNotice, WireError,
};
use warden_session::tls;

/// Errors surfaced by the agent client.
#[derive(Debug, Error)]
pub enum AgentError {
    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Frame encode/decode failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error frame.
    #[error("server error {code}: {message}")]
    Server {
        /// Stable wire code.
        code: String,
        /// Server-provided message.
        message: String,
    },

    /// No live connection; the background task is backing off.
    #[error("not connected")]
    NotConnected,

    /// The request outlived its deadline or the connection dropped.
    #[error("request timed out")]
    Timeout,

    /// The client was closed.
    #[error("client closed")]
    Closed,
}

impl From<warden_session::SessionError> for AgentError {
    fn from(e: warden_session::SessionError) -> Self {
        match e {
            warden_session::SessionError::Tls(msg) => AgentError::Tls(msg),
            warden_session::SessionError::Protocol(msg) => AgentError::Protocol(msg),
            other => AgentError::Transport(other.to_string()),
        }
    }
}

/// Connection endpoints and identity naming.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bootstrap listener, `host:port`.
    pub bootstrap_addr: String,
    /// Session listener, `host:port`.
    pub session_addr: String,
    /// TLS server name the core's certificate carries.
    pub server_name: String,
    /// CA bundle the agent trusts, PEM. Provisioned out of band for the
    /// first bootstrap, refreshed from cert responses afterwards.
    pub ca_chain_pem: String,
    /// Stable agent identifier.
    pub agent_id: String,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Per-request deadline.
    pub request_deadline: Duration,
}

/// Credentials produced by bootstrap. The key pair was generated locally.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Signed client certificate, PEM.
    pub certificate_pem: String,
    /// Private key, PEM.
    pub private_key_pem: String,
    /// CA chain to trust and present, PEM.
    pub ca_chain_pem: String,
}

/// A server push forwarded to the application.
#[derive(Debug, Clone)]
pub enum AgentNotification {
    /// A secret rotated.
    SecretRotated(SecretRotatedNotice),
    /// A policy changed.
    PolicyUpdated(PolicyUpdatedNotice),
    /// This agent's certificate approaches expiry.
    CertExpiring(CertExpiringNotice),
    /// A lease owned by this agent was revoked.
    LeaseRevoked(LeaseRevokedNotice),
}

/// Performs first-time bootstrap: login, key generation, CSR, certificate.
pub async fn bootstrap(
    config: &AgentConfig,
    role_id: &str,
    secret_id: Option<&str>,
) -> Result<AgentIdentity, AgentError> {
    let tls_config = tls::bootstrap_client_config(&config.ca_chain_pem)?;
    let connector = TlsConnector::from(tls_config);

    let tcp = TcpStream::connect(&config.bootstrap_addr)
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    let stream = connector
        .connect(tls::server_name(&config.server_name)?, tcp)
        .await
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    let mut channel = Framed::new(stream, LengthDelimitedCodec::new());

    // Login.
    let login = Frame::new(
        kinds::AUTH_LOGIN,
        1,
        &LoginRequest {
            role_id: role_id.to_string(),
            secret_id: secret_id.map(str::to_string),
        },
    )?;
    let reply = roundtrip(&mut channel, login, config.request_deadline).await?;
    let login: LoginResponse = expect_response(&reply)?;

    info!(agent = %config.agent_id, "Bootstrap login succeeded");

    // Locally generated key pair and CSR carrying the agent identity.
    let key_pair = rcgen::KeyPair::generate().map_err(|e| AgentError::Protocol(e.to_string()))?;
    let csr_pem = build_csr(&key_pair, &config.agent_id)?;

    let cert_request = Frame::new(
        kinds::CERT_REQUEST,
        2,
        &CertRequest {
            token: login.token,
            agent_id: config.agent_id.clone(),
            csr_pem,
        },
    )?;
    let reply = roundtrip(&mut channel, cert_request, config.request_deadline).await?;
    let issued: CertResponse = expect_response(&reply)?;

    info!(agent = %config.agent_id, "Client certificate issued");

    Ok(AgentIdentity {
        certificate_pem: issued.certificate_pem,
        private_key_pem: key_pair.serialize_pem(),
        ca_chain_pem: issued.ca_chain_pem,
    })
}

fn build_csr(key_pair: &rcgen::KeyPair, agent_id: &str) -> Result<String, AgentError> {
    let uri = format!("warden://agent/{agent_id}");

    let mut params = rcgen::CertificateParams::default();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, agent_id);
    params.subject_alt_names.push(rcgen::SanType::URI(
        uri.as_str()
            .try_into()
            .map_err(|e: rcgen::Error| AgentError::Protocol(e.to_string()))?,
    ));

    params
        .serialize_request(key_pair)
        .map_err(|e| AgentError::Protocol(e.to_string()))?
        .pem()
        .map_err(|e| AgentError::Protocol(e.to_string()))
}

async fn roundtrip(
    channel: &mut Framed<tokio_rustls::client::TlsStream<TcpStream>, LengthDelimitedCodec>,
    frame: Frame,
    deadline: Duration,
) -> Result<Frame, AgentError> {
    channel
        .send(Bytes::from(frame.encode().map_err(AgentError::from)?))
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;

    let reply = tokio::time::timeout(deadline, channel.next())
        .await
        .map_err(|_| AgentError::Timeout)?
        .ok_or(AgentError::NotConnected)?
        .map_err(|e| AgentError::Transport(e.to_string()))?;

    Frame::decode(&reply).map_err(AgentError::from)
}

fn expect_response<T: for<'de> serde::Deserialize<'de>>(frame: &Frame) -> Result<T, AgentError> {
    match frame.kind {
        kinds::RESPONSE => frame.body_as().map_err(AgentError::from),
        kinds::ERROR => {
            let wire: WireError = frame.body_as().map_err(AgentError::from)?;
            Err(AgentError::Server {
                code: wire.code,
                message: wire.message,
            })
        }
        other => Err(AgentError::Protocol(format!("unexpected kind {other:#06x}"))),
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

/// The established-session client. Cheap to clone.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: AgentConfig,
    pending: Pending,
    correlation: AtomicU64,
    outbound: mpsc::Sender<Frame>,
    notifications: broadcast::Sender<AgentNotification>,
    cancel: CancellationToken,
}

impl AgentClient {
    /// Starts the client: connects, heartbeats, and reconnects with
    /// backoff until [`AgentClient::close`] is called.
    pub fn start(config: AgentConfig, identity: AgentIdentity) -> Result<Self, AgentError> {
        let tls_config = tls::mtls_client_config(
            &identity.ca_chain_pem,
            &identity.certificate_pem,
            &identity.private_key_pem,
        )?;

        let (outbound, outbound_rx) = mpsc::channel::<Frame>(64);
        let (notifications, _) = broadcast::channel(128);
        let cancel = CancellationToken::new();

        let inner = Arc::new(ClientInner {
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            correlation: AtomicU64::new(1),
            outbound,
            notifications,
            cancel,
        });

        tokio::spawn(io_loop(inner.clone(), TlsConnector::from(tls_config), outbound_rx));

        Ok(Self { inner })
    }

    /// Subscribes to server pushes.
    pub fn notifications(&self) -> broadcast::Receiver<AgentNotification> {
        self.inner.notifications.subscribe()
    }

    /// Reads a secret.
    pub async fn read_secret(
        &self,
        path: &str,
        version: Option<i64>,
    ) -> Result<SecretReadResponse, AgentError> {
        self.request(
            kinds::SECRET_READ,
            &SecretReadRequest {
                path: path.to_string(),
                version,
            },
        )
        .await
    }

    /// Requests a dynamic credential.
    pub async fn dynamic_issue(
        &self,
        role: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<DynamicIssueResponse, AgentError> {
        self.request(
            kinds::SECRET_DYNAMIC_ISSUE,
            &DynamicIssueRequest {
                role: role.to_string(),
                ttl_seconds,
            },
        )
        .await
    }

    /// Renews a lease.
    pub async fn renew_lease(
        &self,
        lease_id: &str,
        increment_seconds: u64,
    ) -> Result<LeaseRenewResponse, AgentError> {
        self.request(
            kinds::LEASE_RENEW,
            &LeaseRenewRequest {
                lease_id: lease_id.to_string(),
                increment_seconds,
            },
        )
        .await
    }

    /// Revokes a lease.
    pub async fn revoke_lease(&self, lease_id: &str) -> Result<Ack, AgentError> {
        self.request(
            kinds::LEASE_REVOKE,
            &LeaseRevokeRequest {
                lease_id: lease_id.to_string(),
            },
        )
        .await
    }

    /// Sends one heartbeat and waits for the ack.
    pub async fn heartbeat(&self) -> Result<Ack, AgentError> {
        self.request(kinds::HEARTBEAT, &Ack::default()).await
    }

    /// Closes the client and cancels outstanding requests. Lease
    /// ownership is unaffected.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    async fn request<Req: serde::Serialize, Resp: for<'de> serde::Deserialize<'de>>(
        &self,
        kind: u16,
        body: &Req,
    ) -> Result<Resp, AgentError> {
        if self.inner.cancel.is_cancelled() {
            return Err(AgentError::Closed);
        }

        let correlation = self.inner.correlation.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new(kind, correlation, body)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending).insert(correlation, reply_tx);

        if self.inner.outbound.send(frame).await.is_err() {
            lock(&self.inner.pending).remove(&correlation);
            return Err(AgentError::Closed);
        }

        let reply = tokio::time::timeout(self.inner.config.request_deadline, reply_rx)
            .await
            .map_err(|_| {
                lock(&self.inner.pending).remove(&correlation);
                AgentError::Timeout
            })?
            .map_err(|_| AgentError::NotConnected)?;

        expect_response(&reply)
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Frame>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection supervisor: connect, pump, reconnect with jittered
/// exponential backoff starting at one second and capping at sixty.
async fn io_loop(
    inner: Arc<ClientInner>,
    connector: TlsConnector,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    let mut backoff = Duration::from_secs(1);
    const BACKOFF_CAP: Duration = Duration::from_secs(60);

    loop {
        if inner.cancel.is_cancelled() {
            fail_pending(&inner.pending);
            return;
        }

        match connect_once(&inner, &connector, &mut outbound_rx).await {
            Ok(ConnectionEnd::Closed) => {
                fail_pending(&inner.pending);
                return;
            }
            Ok(ConnectionEnd::Lost) => {
                // A successful session resets the backoff.
                backoff = Duration::from_secs(1);
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
            }
        }

        fail_pending(&inner.pending);

        let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
        let wait = backoff + Duration::from_millis(jitter);
        debug!(delay = ?wait, "Reconnecting after backoff");

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

enum ConnectionEnd {
    /// Client asked to close.
    Closed,
    /// Transport dropped after a working session.
    Lost,
}

async fn connect_once(
    inner: &Arc<ClientInner>,
    connector: &TlsConnector,
    outbound_rx: &mut mpsc::Receiver<Frame>,
) -> Result<ConnectionEnd, AgentError> {
    let tcp = TcpStream::connect(&inner.config.session_addr)
        .await
        .map_err(|e| AgentError::Transport(e.to_string()))?;
    let stream = connector
        .connect(tls::server_name(&inner.config.server_name)?, tcp)
        .await
        .map_err(|e| AgentError::Tls(e.to_string()))?;

    info!(addr = %inner.config.session_addr, "Session established");

    let channel = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = channel.split();

    let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(ConnectionEnd::Closed);
            }

            _ = heartbeat.tick() => {
                let correlation = inner.correlation.fetch_add(1, Ordering::Relaxed);
                let frame = Frame::new(kinds::HEARTBEAT, correlation, &Ack::default())?;
                sink.send(Bytes::from(frame.encode()?))
                    .await
                    .map_err(|e| AgentError::Transport(e.to_string()))?;
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        sink.send(Bytes::from(frame.encode()?))
                            .await
                            .map_err(|e| AgentError::Transport(e.to_string()))?;
                    }
                    None => return Ok(ConnectionEnd::Closed),
                }
            }

            incoming = stream.next() => {
                let bytes = match incoming {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!(error = %e, "Session read failed");
                        return Ok(ConnectionEnd::Lost);
                    }
                    None => return Ok(ConnectionEnd::Lost),
                };

                let frame = match Frame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Undecodable frame from server");
                        continue;
                    }
                };

                if frame.correlation == 0 {
                    dispatch_notification(inner, &frame);
                } else if let Some(waiter) = lock(&inner.pending).remove(&frame.correlation) {
                    let _ = waiter.send(frame);
                }
                // Unmatched correlations belong to requests that already
                // timed out; drop them.
            }
        }
    }
}

fn dispatch_notification(inner: &Arc<ClientInner>, frame: &Frame) {
    let parsed = match frame.kind {
        kinds::NOTIFY_SECRET_ROTATED => frame
            .body_as::<SecretRotatedNotice>()
            .map(AgentNotification::SecretRotated),
        kinds::NOTIFY_POLICY_UPDATED => frame
            .body_as::<PolicyUpdatedNotice>()
            .map(AgentNotification::PolicyUpdated),
        kinds::NOTIFY_CERT_EXPIRING => frame
            .body_as::<CertExpiringNotice>()
            .map(AgentNotification::CertExpiring),
        kinds::NOTIFY_LEASE_REVOKED => frame
            .body_as::<LeaseRevokedNotice>()
            .map(AgentNotification::LeaseRevoked),
        other => {
            debug!(kind = other, "Ignoring unknown notification kind");
            return;
        }
    };

    match parsed {
        Ok(notification) => {
            let _ = inner.notifications.send(notification);
        }
        Err(e) => warn!(error = %e, "Malformed notification"),
    }
}

fn fail_pending(pending: &Pending) {
    // Dropping the senders wakes every waiter with a channel error, which
    // surfaces as NotConnected; callers retry on a fresh correlation.
    lock(pending).clear();
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_build_csr() {
        let key = rcgen::KeyPair::generate().unwrap();
        let csr = build_csr(&key, "agent-7").unwrap();
        assert!(csr.contains("BEGIN CERTIFICATE REQUEST"));
    }

    #[test]
    fn test_expect_response_maps_errors() {
        let err_frame = Frame::new(
            kinds::ERROR,
            3,
            &WireError {
                code: "sealed".to_string(),
                message: "core is sealed".to_string(),
            },
        )
        .unwrap();

        let result: Result<Ack, _> = expect_response(&err_frame);
        match result {
            Err(AgentError::Server { code, .. }) => assert_eq!(code, "sealed"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_expect_response_ok() {
        let frame = Frame::new(kinds::RESPONSE, 3, &Ack::default()).unwrap();
        let result: Result<Ack, _> = expect_response(&frame);
        assert!(result.is_ok());
    }
}
