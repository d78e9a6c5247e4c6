//! The agent channel server.
//!
//! Two listeners share the framed CBOR protocol:
//!
//! - **bootstrap**: server-authenticated TLS. An agent logs in with
//!   AppRole, submits a CSR under its session token, and receives its
//!   client certificate plus the CA chain.
//! - **session**: mutually authenticated TLS. The client certificate is
//!   re-verified against revocation state after the handshake and maps to
//!   an agent binding; requests are then dispatched one task each, so a
//!   slow secret read never blocks a heartbeat.
//!
//! Silence past twice the heartbeat interval closes the connection.
//! Shutdown drains in-flight requests within a bounded deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_audit::{kind as audit_kind, Actor, AuditEvent, AuditLog, Outcome};
use warden_auth::{AppRoleBackend, AuthError, TokenStore};
use warden_lease::{LeaseError, LeaseManager};
use warden_pki::{CertificateAuthority, PkiError};
use warden_policy::{Principal, RequestContext};
use warden_secrets::{SecretsEngine, SecretsError};
use warden_storage::records::{AgentBindingRecord, AgentStatus, CertificateType};
use warden_storage_sqlite::SqliteBackend;

use crate::error::SessionError;
use crate::notify::{applies_to, NotificationHub};
use crate::proto::{
    codes, kinds, Ack, CertRequest, CertResponse, DynamicIssueRequest, DynamicIssueResponse,
    Frame, LeaseRenewRequest, LeaseRenewResponse, LeaseRevokeRequest, LoginRequest,
    LoginResponse, SecretReadRequest, SecretReadResponse, WireError,
};
use crate::tls;

/// Session server tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bootstrap listener address.
    pub bootstrap_addr: SocketAddr,
    /// mTLS session listener address.
    pub session_addr: SocketAddr,
    /// Expected heartbeat cadence; silence past twice this closes the peer.
    pub heartbeat_interval: Duration,
    /// Per-request deadline.
    pub request_deadline: Duration,
    /// How long shutdown waits for in-flight requests.
    pub drain_deadline: Duration,
    /// Validity of issued agent client certificates, days.
    pub client_cert_validity_days: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap_addr: ([127, 0, 0, 1], 0).into(),
            session_addr: ([127, 0, 0, 1], 0).into(),
            heartbeat_interval: Duration::from_secs(30),
            request_deadline: Duration::from_secs(30),
            drain_deadline: Duration::from_secs(10),
            client_cert_validity_days: 90,
        }
    }
}

/// Engine handles the channel dispatches into.
#[derive(Clone)]
pub struct SessionEngines {
    /// Storage (agent bindings, roles).
    pub storage: SqliteBackend,
    /// Session token issuance/validation.
    pub tokens: TokenStore,
    /// AppRole login.
    pub approle: AppRoleBackend,
    /// Certificate authority.
    pub pki: CertificateAuthority,
    /// Secrets engine.
    pub secrets: SecretsEngine,
    /// Lease manager.
    pub leases: Arc<LeaseManager>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Notification fan-out.
    pub notifications: NotificationHub,
}

/// TLS material for the listeners.
#[derive(Clone)]
pub struct ListenerTls {
    /// Server leaf certificate plus any intermediates, PEM.
    pub server_cert_pem: String,
    /// Server private key, PEM.
    pub server_key_pem: String,
    /// CA bundle client certificates must chain to, PEM.
    pub ca_chain_pem: String,
}

/// A started server: bound addresses plus its accept-loop handles.
pub struct RunningSessionServer {
    /// Bound bootstrap address.
    pub bootstrap_addr: SocketAddr,
    /// Bound session address.
    pub session_addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl RunningSessionServer {
    /// Waits for the accept loops to finish (after cancellation).
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Starts both listeners. Accept loops run until `cancel` fires.
pub async fn start(
    engines: SessionEngines,
    config: SessionConfig,
    tls_material: ListenerTls,
    cancel: CancellationToken,
) -> Result<RunningSessionServer, SessionError> {
    let engines = Arc::new(engines);
    let config = Arc::new(config);

    let bootstrap_tls = tls::bootstrap_server_config(
        &tls_material.server_cert_pem,
        &tls_material.server_key_pem,
    )?;
    let session_tls = tls::mtls_server_config(
        &tls_material.server_cert_pem,
        &tls_material.server_key_pem,
        &tls_material.ca_chain_pem,
    )?;

    let bootstrap_listener = TcpListener::bind(config.bootstrap_addr).await?;
    let session_listener = TcpListener::bind(config.session_addr).await?;

    let bootstrap_addr = bootstrap_listener.local_addr()?;
    let session_addr = session_listener.local_addr()?;

    info!(%bootstrap_addr, %session_addr, "Agent channel listening");

    let handles = vec![
        tokio::spawn(accept_loop(
            bootstrap_listener,
            TlsAcceptor::from(bootstrap_tls),
            engines.clone(),
            config.clone(),
            cancel.clone(),
            ChannelKind::Bootstrap,
        )),
        tokio::spawn(accept_loop(
            session_listener,
            TlsAcceptor::from(session_tls),
            engines,
            config,
            cancel,
            ChannelKind::Session,
        )),
    ];

    Ok(RunningSessionServer {
        bootstrap_addr,
        session_addr,
        handles,
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Bootstrap,
    Session,
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    engines: Arc<SessionEngines>,
    config: Arc<SessionConfig>,
    cancel: CancellationToken,
    kind: ChannelKind,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Accept loop stopped");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let engines = engines.clone();
                let config = config.clone();
                let cancel = cancel.clone();

                tokio::spawn(async move {
                    let result = match kind {
                        ChannelKind::Bootstrap => {
                            handle_bootstrap(acceptor, stream, peer_addr, engines, config, cancel)
                                .await
                        }
                        ChannelKind::Session => {
                            handle_session(acceptor, stream, peer_addr, engines, config, cancel)
                                .await
                        }
                    };

                    if let Err(e) = result {
                        debug!(peer = %peer_addr, error = %e, "Connection ended with error");
                    }
                });
            }
        }
    }
}

fn framed(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Framed<tokio_rustls::server::TlsStream<TcpStream>, LengthDelimitedCodec> {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(1024 * 1024);
    Framed::new(stream, codec)
}

// ---------------------------------------------------------------------------
// Bootstrap channel
// ---------------------------------------------------------------------------

async fn handle_bootstrap(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer_addr: SocketAddr,
    engines: Arc<SessionEngines>,
    config: Arc<SessionConfig>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| SessionError::Tls(e.to_string()))?;

    debug!(peer = %peer_addr, "Bootstrap connection established");

    let mut channel = framed(tls_stream);
    let idle = config.heartbeat_interval * 2;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = tokio::time::timeout(idle, channel.next()) => next,
        };

        let bytes = match next {
            Err(_) => return Err(SessionError::PeerTimeout),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(bytes))) => bytes,
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Bad bootstrap frame");
                continue;
            }
        };

        let reply = bootstrap_dispatch(&engines, &config, &frame).await;
        channel
            .send(Bytes::from(reply.encode()?))
            .await
            .map_err(SessionError::from)?;
    }
}

async fn bootstrap_dispatch(
    engines: &SessionEngines,
    config: &SessionConfig,
    frame: &Frame,
) -> Frame {
    let correlation = frame.correlation;

    let result = match frame.kind {
        kinds::AUTH_LOGIN => bootstrap_login(engines, frame, correlation).await,
        kinds::CERT_REQUEST => bootstrap_cert(engines, config, frame, correlation).await,
        kinds::HEARTBEAT => Frame::new(kinds::RESPONSE, correlation, &Ack::default()),
        _ => error_frame(
            correlation,
            codes::INVALID,
            "unsupported frame on bootstrap channel",
        ),
    };

    result.unwrap_or_else(|e| internal_error_frame(correlation, &e))
}

async fn bootstrap_login(
    engines: &SessionEngines,
    frame: &Frame,
    correlation: u64,
) -> Result<Frame, SessionError> {
    let request: LoginRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(correlation, codes::INVALID, "malformed login"),
    };

    match engines
        .approle
        .login(&request.role_id, request.secret_id.as_deref())
        .await
    {
        Ok((token, ctx)) => Frame::new(
            kinds::RESPONSE,
            correlation,
            &LoginResponse {
                token,
                policies: ctx.policies,
                expires_at: ctx.expires_at.map(|t| t.timestamp()).unwrap_or(0),
            },
        ),
        Err(e) => {
            let wire = wire_auth_error(&e);
            error_frame(correlation, &wire.code, &wire.message)
        }
    }
}

async fn bootstrap_cert(
    engines: &SessionEngines,
    config: &SessionConfig,
    frame: &Frame,
    correlation: u64,
) -> Result<Frame, SessionError> {
    let request: CertRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(correlation, codes::INVALID, "malformed cert request"),
    };

    let ctx = match engines.tokens.validate(&request.token).await {
        Ok(ctx) => ctx,
        Err(e) => {
            let wire = wire_auth_error(&e);
            return error_frame(correlation, &wire.code, &wire.message);
        }
    };

    // A bootstrap token is single-identity: once bound to a certificate it
    // cannot mint another. Renewal happens on the established session.
    if ctx.bound_cert_fingerprint.is_some() {
        return error_frame(
            correlation,
            codes::ACCESS_DENIED,
            "token already bound to a certificate",
        );
    }

    match issue_agent_certificate(
        engines,
        config.client_cert_validity_days,
        &ctx.entity_id,
        ctx.role_name.as_deref(),
        &request,
    )
    .await
    {
        Ok(response) => {
            // Bind the bootstrap token to the certificate it produced.
            if let Ok(fp) = warden_pki::verify::fingerprint(&response.certificate_pem) {
                let _ = engines.tokens.bind_certificate(&request.token, &fp).await;
            }
            Frame::new(kinds::RESPONSE, correlation, &response)
        }
        Err(wire) => error_frame(correlation, &wire.code, &wire.message),
    }
}

async fn issue_agent_certificate(
    engines: &SessionEngines,
    validity_days: u32,
    entity_id: &str,
    role_name: Option<&str>,
    request: &CertRequest,
) -> Result<CertResponse, WireError> {
    if request.agent_id.is_empty() {
        return Err(WireError {
            code: codes::INVALID.to_string(),
            message: "agent_id required".to_string(),
        });
    }

    let role_name = role_name.unwrap_or("unknown").to_string();

    if engines
        .storage
        .get_agent_binding(&request.agent_id)
        .await
        .map_err(internal_wire)?
        .is_none()
    {
        engines
            .storage
            .upsert_agent_binding(&AgentBindingRecord {
                agent_id: request.agent_id.clone(),
                role_name: role_name.clone(),
                certificate_id: None,
                last_seen: None,
                status: AgentStatus::Pending,
                created_at: Utc::now(),
            })
            .await
            .map_err(internal_wire)?;
    }

    let ca = engines
        .pki
        .select_signing_ca()
        .await
        .map_err(|e| wire_pki_error(&e))?;

    let signed = engines
        .pki
        .sign_csr(
            &request.csr_pem,
            ca.id,
            CertificateType::AgentClient,
            validity_days,
            &Actor::agent(entity_id),
        )
        .await
        .map_err(|e| wire_pki_error(&e))?;

    engines
        .storage
        .set_agent_certificate(&request.agent_id, signed.record.id)
        .await
        .map_err(internal_wire)?;

    info!(agent = %request.agent_id, serial = %signed.record.serial, "Agent certificate issued");

    Ok(CertResponse {
        certificate_pem: signed.certificate_pem,
        ca_chain_pem: signed.ca_chain_pem,
        expires_at: signed.record.not_after.timestamp(),
    })
}

// ---------------------------------------------------------------------------
// mTLS session channel
// ---------------------------------------------------------------------------

async fn handle_session(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer_addr: SocketAddr,
    engines: Arc<SessionEngines>,
    config: Arc<SessionConfig>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| SessionError::Tls(e.to_string()))?;

    // webpki proved the chain during the handshake; re-verify against
    // revocation state and map the identity onto an agent binding.
    let peer_certs = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .ok_or_else(|| SessionError::PeerRejected("no client certificate".into()))?;

    let leaf = peer_certs
        .first()
        .ok_or_else(|| SessionError::PeerRejected("empty certificate chain".into()))?;
    let leaf_pem = tls::der_to_pem(leaf.as_ref());
    let chain_pems: Vec<String> = peer_certs[1..]
        .iter()
        .map(|c| tls::der_to_pem(c.as_ref()))
        .collect();

    let identity = engines
        .pki
        .verify_peer(&leaf_pem, &chain_pems)
        .await
        .map_err(|e| SessionError::PeerRejected(e.to_string()))?;

    let agent_id = agent_id_from_principal(&identity.principal);

    let binding = engines
        .storage
        .get_agent_binding(&agent_id)
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?
        .ok_or_else(|| SessionError::UnknownAgent(agent_id.clone()))?;

    if binding.status != AgentStatus::Active {
        return Err(SessionError::AgentNotActive(agent_id.clone()));
    }

    let role = engines
        .storage
        .get_role(&binding.role_name)
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?
        .ok_or_else(|| SessionError::AgentNotActive(binding.role_name.clone()))?;

    let principal = Arc::new(Principal::agent(
        format!("agent:{agent_id}"),
        role.policies.clone(),
    ));

    engines
        .storage
        .touch_agent(&agent_id, Utc::now())
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;

    engines
        .audit
        .append(AuditEvent::new(
            audit_kind::SESSION_OPEN,
            Actor::agent(&principal.entity_id),
            format!("session/{agent_id}"),
            Outcome::Success,
        ))
        .await
        .map_err(|e| SessionError::Internal(e.to_string()))?;

    info!(peer = %peer_addr, agent = %agent_id, "Agent session established");

    let result = session_loop(&engines, &config, tls_stream, peer_addr, &principal, &cancel).await;

    let _ = engines
        .audit
        .append(AuditEvent::new(
            audit_kind::SESSION_CLOSE,
            Actor::agent(&principal.entity_id),
            format!("session/{agent_id}"),
            Outcome::Success,
        ))
        .await;

    info!(peer = %peer_addr, agent = %agent_id, "Agent session closed");

    result
}

async fn session_loop(
    engines: &Arc<SessionEngines>,
    config: &Arc<SessionConfig>,
    tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
    peer_addr: SocketAddr,
    principal: &Arc<Principal>,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let channel = framed(tls_stream);
    let (mut sink, mut stream) = channel.split();

    let (tx, mut rx) = mpsc::channel::<Frame>(64);

    let writer: JoinHandle<Result<(), SessionError>> = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            sink.send(Bytes::from(frame.encode()?)).await?;
        }
        let _ = sink.close().await;
        Ok(())
    });

    let mut notifications = engines.notifications.subscribe();
    let mut inflight: JoinSet<()> = JoinSet::new();
    let idle = config.heartbeat_interval * 2;

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),

            notice = notifications.recv() => {
                if let Ok(targeted) = notice {
                    if applies_to(&targeted, &principal.entity_id) {
                        if let Ok(frame) = targeted.notification.to_frame() {
                            let _ = tx.send(frame).await;
                        }
                    }
                }
            }

            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}

            next = tokio::time::timeout(idle, stream.next()) => {
                let bytes = match next {
                    Err(_) => break Err(SessionError::PeerTimeout),
                    Ok(None) => break Ok(()),
                    Ok(Some(Err(e))) => break Err(e.into()),
                    Ok(Some(Ok(bytes))) => bytes,
                };

                let frame = match Frame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer = %peer_addr, error = %e, "Undecodable frame");
                        continue;
                    }
                };

                if frame.kind == kinds::HEARTBEAT {
                    let _ = tx.send(
                        Frame::new(kinds::RESPONSE, frame.correlation, &Ack::default())
                            .unwrap_or_else(|_| Frame {
                                version: crate::proto::PROTOCOL_VERSION,
                                kind: kinds::RESPONSE,
                                correlation: frame.correlation,
                                body: ciborium::value::Value::Null,
                            }),
                    )
                    .await;
                    continue;
                }

                // One task per request: independent requests proceed in
                // parallel, responses match up by correlation.
                let engines = engines.clone();
                let principal = principal.clone();
                let tx = tx.clone();
                let deadline = config.request_deadline;
                let validity_days = config.client_cert_validity_days;
                let source_ip = peer_addr.ip();

                inflight.spawn(async move {
                    let correlation = frame.correlation;
                    let handled = tokio::time::timeout(
                        deadline,
                        session_dispatch(&engines, &principal, source_ip, validity_days, frame),
                    )
                    .await;

                    let reply = match handled {
                        Ok(reply) => reply,
                        Err(_) => error_frame(correlation, codes::TIMEOUT, "request deadline elapsed")
                            .unwrap_or_else(|e| internal_error_frame(correlation, &e)),
                    };

                    let _ = tx.send(reply).await;
                });
            }
        }
    };

    // Graceful drain: let in-flight requests finish within the deadline,
    // then abort the stragglers.
    let drained = tokio::time::timeout(config.drain_deadline, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        inflight.abort_all();
    }

    drop(tx);
    match writer.await {
        Ok(result) => result?,
        Err(e) => return Err(SessionError::Internal(e.to_string())),
    }

    outcome
}

async fn session_dispatch(
    engines: &SessionEngines,
    principal: &Principal,
    source_ip: std::net::IpAddr,
    cert_validity_days: u32,
    frame: Frame,
) -> Frame {
    let correlation = frame.correlation;
    let ctx = RequestContext {
        now: Utc::now(),
        source_ip: Some(source_ip),
        requested_ttl_seconds: None,
    };

    let result = match frame.kind {
        kinds::SECRET_READ => handle_secret_read(engines, principal, &ctx, &frame).await,
        kinds::SECRET_DYNAMIC_ISSUE => handle_dynamic_issue(engines, principal, &ctx, &frame).await,
        kinds::LEASE_RENEW => handle_lease_renew(engines, principal, &ctx, &frame).await,
        kinds::LEASE_REVOKE => handle_lease_revoke(engines, principal, &frame).await,
        kinds::CERT_REQUEST => handle_cert_renewal(engines, principal, cert_validity_days, &frame).await,
        _ => error_frame(correlation, codes::INVALID, "unsupported frame kind"),
    };

    result.unwrap_or_else(|e| internal_error_frame(correlation, &e))
}

async fn handle_secret_read(
    engines: &SessionEngines,
    principal: &Principal,
    ctx: &RequestContext,
    frame: &Frame,
) -> Result<Frame, SessionError> {
    let request: SecretReadRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(frame.correlation, codes::INVALID, "malformed request"),
    };

    match engines
        .secrets
        .read(&request.path, request.version, principal, ctx)
        .await
    {
        Ok(secret) => Frame::new(
            kinds::RESPONSE,
            frame.correlation,
            &SecretReadResponse {
                path: secret.path,
                version: secret.version,
                data: secret.data,
            },
        ),
        Err(e) => {
            let wire = wire_secrets_error(&e);
            error_frame(frame.correlation, &wire.code, &wire.message)
        }
    }
}

async fn handle_dynamic_issue(
    engines: &SessionEngines,
    principal: &Principal,
    ctx: &RequestContext,
    frame: &Frame,
) -> Result<Frame, SessionError> {
    let request: DynamicIssueRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(frame.correlation, codes::INVALID, "malformed request"),
    };

    let ttl = request
        .ttl_seconds
        .map(|s| chrono::Duration::seconds(s.min(i64::MAX as u64) as i64));

    match engines.leases.issue(&request.role, ttl, principal, ctx).await {
        Ok(lease) => Frame::new(
            kinds::RESPONSE,
            frame.correlation,
            &DynamicIssueResponse {
                lease_id: lease.lease_id.to_string(),
                credentials: lease.credentials,
                expires_at: lease.expires_at.timestamp(),
            },
        ),
        Err(e) => {
            let wire = wire_lease_error(&e);
            error_frame(frame.correlation, &wire.code, &wire.message)
        }
    }
}

async fn handle_lease_renew(
    engines: &SessionEngines,
    principal: &Principal,
    ctx: &RequestContext,
    frame: &Frame,
) -> Result<Frame, SessionError> {
    let request: LeaseRenewRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(frame.correlation, codes::INVALID, "malformed request"),
    };

    let Ok(lease_id) = Uuid::parse_str(&request.lease_id) else {
        return error_frame(frame.correlation, codes::INVALID, "bad lease id");
    };

    let increment = chrono::Duration::seconds(request.increment_seconds.min(i64::MAX as u64) as i64);

    match engines.leases.renew(lease_id, increment, principal, ctx).await {
        Ok(expires_at) => Frame::new(
            kinds::RESPONSE,
            frame.correlation,
            &LeaseRenewResponse {
                expires_at: expires_at.timestamp(),
            },
        ),
        Err(e) => {
            let wire = wire_lease_error(&e);
            error_frame(frame.correlation, &wire.code, &wire.message)
        }
    }
}

async fn handle_lease_revoke(
    engines: &SessionEngines,
    principal: &Principal,
    frame: &Frame,
) -> Result<Frame, SessionError> {
    let request: LeaseRevokeRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(frame.correlation, codes::INVALID, "malformed request"),
    };

    let Ok(lease_id) = Uuid::parse_str(&request.lease_id) else {
        return error_frame(frame.correlation, codes::INVALID, "bad lease id");
    };

    match engines.leases.revoke(lease_id, principal).await {
        Ok(()) => Frame::new(kinds::RESPONSE, frame.correlation, &Ack::default()),
        Err(e) => {
            let wire = wire_lease_error(&e);
            error_frame(frame.correlation, &wire.code, &wire.message)
        }
    }
}

/// Certificate renewal on an established session: the session identity
/// stands in for the bootstrap token.
async fn handle_cert_renewal(
    engines: &SessionEngines,
    principal: &Principal,
    validity_days: u32,
    frame: &Frame,
) -> Result<Frame, SessionError> {
    let request: CertRequest = match frame.body_as() {
        Ok(request) => request,
        Err(_) => return error_frame(frame.correlation, codes::INVALID, "malformed request"),
    };

    let agent_id = principal
        .entity_id
        .strip_prefix("agent:")
        .unwrap_or(&principal.entity_id)
        .to_string();

    if request.agent_id != agent_id {
        return error_frame(
            frame.correlation,
            codes::ACCESS_DENIED,
            "certificate renewal is limited to the session's own identity",
        );
    }

    let binding = match engines.storage.get_agent_binding(&agent_id).await {
        Ok(Some(binding)) => binding,
        Ok(None) => return error_frame(frame.correlation, codes::NOT_FOUND, "unknown agent"),
        Err(e) => {
            return error_frame(frame.correlation, codes::INTERNAL, &e.to_string());
        }
    };

    match issue_agent_certificate(
        engines,
        validity_days,
        &principal.entity_id,
        Some(&binding.role_name),
        &request,
    )
    .await
    {
        Ok(response) => Frame::new(kinds::RESPONSE, frame.correlation, &response),
        Err(wire) => error_frame(frame.correlation, &wire.code, &wire.message),
    }
}

fn agent_id_from_principal(principal: &str) -> String {
    principal
        .strip_prefix("warden://agent/")
        .unwrap_or(principal)
        .to_string()
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_frame(correlation: u64, code: &str, message: &str) -> Result<Frame, SessionError> {
    Frame::new(
        kinds::ERROR,
        correlation,
        &WireError {
            code: code.to_string(),
            message: message.to_string(),
        },
    )
}

fn internal_error_frame(correlation: u64, error: &SessionError) -> Frame {
    warn!(error = %error, "Failed to build reply frame");
    Frame {
        version: crate::proto::PROTOCOL_VERSION,
        kind: kinds::ERROR,
        correlation,
        body: ciborium::value::Value::Null,
    }
}

fn internal_wire<E: std::fmt::Display>(e: E) -> WireError {
    WireError {
        code: codes::INTERNAL.to_string(),
        message: e.to_string(),
    }
}

fn wire_auth_error(e: &AuthError) -> WireError {
    let (code, message) = match e {
        AuthError::InvalidCredentials | AuthError::TokenNotFound | AuthError::MissingToken => {
            (codes::INVALID_CREDENTIALS, "invalid credentials")
        }
        AuthError::TokenExpired => (codes::EXPIRED, "token expired"),
        AuthError::TokenRevoked => (codes::REVOKED, "token revoked"),
        AuthError::InvalidInput(_) => (codes::INVALID, "invalid input"),
        _ => (codes::INTERNAL, "internal error"),
    };
    WireError {
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn wire_secrets_error(e: &SecretsError) -> WireError {
    let (code, message) = match e {
        SecretsError::Sealed => (codes::SEALED, "core is sealed"),
        // The denying policy's name is admin-only detail.
        SecretsError::AccessDenied { .. } => (codes::ACCESS_DENIED, "access denied"),
        SecretsError::NotFound(_) | SecretsError::VersionNotFound { .. } => {
            (codes::NOT_FOUND, "not found")
        }
        SecretsError::InvalidPath(_) | SecretsError::InvalidPayload(_) => {
            (codes::INVALID, "invalid request")
        }
        _ => (codes::INTERNAL, "internal error"),
    };
    WireError {
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn wire_lease_error(e: &LeaseError) -> WireError {
    let (code, message) = match e {
        LeaseError::NotFound(_) => (codes::NOT_FOUND, "not found"),
        LeaseError::LeaseExpired(_) => (codes::EXPIRED, "lease expired"),
        LeaseError::LeaseRevoked(_) => (codes::REVOKED, "lease revoked"),
        LeaseError::MaxTtlExceeded(_) => (codes::INVALID, "lease at max ttl"),
        LeaseError::AccessDenied { .. } => (codes::ACCESS_DENIED, "access denied"),
        LeaseError::UnknownRole(_) | LeaseError::InvalidInput(_) => {
            (codes::INVALID, "invalid request")
        }
        LeaseError::BackendUnavailable(_) => (codes::INTERNAL, "backend unavailable"),
        _ => (codes::INTERNAL, "internal error"),
    };
    WireError {
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn wire_pki_error(e: &PkiError) -> WireError {
    let (code, message) = match e {
        PkiError::Sealed => (codes::SEALED, "core is sealed"),
        PkiError::InvalidCsr(_) | PkiError::InvalidInput(_) => (codes::INVALID, "invalid CSR"),
        PkiError::ValidityExceedsCa => (codes::INVALID, "validity exceeds CA"),
        PkiError::Revoked(_) => (codes::REVOKED, "certificate revoked"),
        PkiError::Expired => (codes::EXPIRED, "certificate expired"),
        PkiError::UntrustedIssuer | PkiError::SignatureInvalid => {
            (codes::ACCESS_DENIED, "untrusted certificate")
        }
        PkiError::NoRootCa => (codes::INTERNAL, "PKI not initialized"),
        _ => (codes::INTERNAL, "internal error"),
    };
    WireError {
        code: code.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_extraction() {
        assert_eq!(agent_id_from_principal("warden://agent/a-1"), "a-1");
        assert_eq!(agent_id_from_principal("bare-name"), "bare-name");
    }

    #[test]
    fn test_error_mapping_hides_policy_detail() {
        let wire = wire_secrets_error(&SecretsError::AccessDenied {
            policy: Some("deny_prod".to_string()),
        });
        assert_eq!(wire.code, codes::ACCESS_DENIED);
        assert!(!wire.message.contains("deny_prod"));
    }

    #[test]
    fn test_auth_errors_collapse() {
        for e in [
            AuthError::InvalidCredentials,
            AuthError::TokenNotFound,
            AuthError::MissingToken,
        ] {
            assert_eq!(wire_auth_error(&e).code, codes::INVALID_CREDENTIALS);
        }
    }

    #[test]
    fn test_lease_error_codes() {
        assert_eq!(
            wire_lease_error(&LeaseError::LeaseExpired("x".into())).code,
            codes::EXPIRED
        );
        assert_eq!(
            wire_lease_error(&LeaseError::LeaseRevoked("x".into())).code,
            codes::REVOKED
        );
    }
}
