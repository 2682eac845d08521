use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ember_cluster::LocalCluster;
use ember_common::config::SessionConfig;
use ember_common::types::SessionId;
use ember_observability::record_active_connections;

use crate::codec::{self, BackendMessage, FrontendMessage};
use crate::handler::{Backend, Flow};
use crate::interrupts::InterruptState;
use crate::session::Session;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Entry in the cancellation registry for a session.
pub struct CancelEntry {
    secret_key: i32,
    interrupts: Arc<InterruptState>,
}

/// Maps process id (session id) to the session's interrupt flags.
pub type CancellationRegistry = Arc<DashMap<i32, CancelEntry>>;

/// PostgreSQL wire protocol server.
pub struct PgServer {
    listen_addr: String,
    cluster: Arc<LocalCluster>,
    session_config: SessionConfig,
    next_session_id: AtomicI32,
    cancel_registry: CancellationRegistry,
}

impl PgServer {
    pub fn new(listen_addr: String, cluster: Arc<LocalCluster>, session_config: SessionConfig) -> Self {
        Self {
            listen_addr,
            cluster,
            session_config,
            next_session_id: AtomicI32::new(1),
            cancel_registry: Arc::new(DashMap::new()),
        }
    }

    /// Start the PG server and listen for connections.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then ask every live session to
    /// terminate at its next interrupt check.
    pub async fn run_with_shutdown(
        &self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), BoxError> {
        tracing::info!(addr = %listener.local_addr()?, "PG server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, addr) = result?;
                    tracing::info!(%addr, "new connection");
                    self.spawn_connection(stream);
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received, stopping new connections");
                    break;
                }
            }
        }
        for entry in self.cancel_registry.iter() {
            entry.interrupts.request_terminate();
        }
        tracing::info!(sessions = self.cancel_registry.len(), "server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let cluster = self.cluster.clone();
        let config = self.session_config.clone();
        let cancel_reg = self.cancel_registry.clone();

        tokio::spawn(async move {
            if let Err(e) =
                handle_connection(stream, session_id, cluster.clone(), config, cancel_reg.clone()).await
            {
                tracing::error!(session_id, error = %e, "connection error");
            }
            cancel_reg.remove(&session_id);
            record_active_connections(cluster.admission.active_connections());
            tracing::info!(session_id, "connection closed");
        });
    }
}

fn new_secret_key() -> i32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as i32
}

fn handle_cancel_request(registry: &CancellationRegistry, process_id: i32, secret_key: i32) {
    match registry.get(&process_id) {
        Some(entry) if entry.secret_key == secret_key => {
            entry.interrupts.request_cancel();
            tracing::info!(session_id = process_id, "cancel request accepted");
        }
        Some(_) => {
            tracing::warn!(session_id = process_id, "cancel request rejected: wrong secret key");
        }
        None => {
            tracing::debug!(session_id = process_id, "cancel request for unknown session");
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    session_id: i32,
    cluster: Arc<LocalCluster>,
    config: SessionConfig,
    cancel_registry: CancellationRegistry,
) -> Result<(), BoxError> {
    let max_len = config.max_message_len;
    let mut buf = BytesMut::with_capacity(8192);

    // Phase 1: startup handshake
    let params: HashMap<String, String> = 'startup: loop {
        while let Some(msg) = codec::decode_startup(&mut buf, max_len)? {
            match msg {
                FrontendMessage::SslRequest => {
                    stream.write_all(b"N").await?;
                }
                FrontendMessage::CancelRequest {
                    process_id,
                    secret_key,
                } => {
                    // The cancel connection carries nothing else.
                    handle_cancel_request(&cancel_registry, process_id, secret_key);
                    return Ok(());
                }
                FrontendMessage::Startup { version, params } => {
                    tracing::debug!(session_id, version, ?params, "startup");
                    break 'startup params;
                }
                other => {
                    return Err(format!(
                        "unexpected message during startup: {}",
                        char::from(other.tag())
                    )
                    .into());
                }
            }
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    };

    let _permit = match cluster.admission.acquire_connection() {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "connection rejected");
            let msg = BackendMessage::ErrorResponse {
                severity: "FATAL".into(),
                code: "53300".into(),
                message: "sorry, too many clients already".into(),
            };
            let _ = send_messages(&mut stream, &[msg]).await;
            return Ok(());
        }
    };
    record_active_connections(cluster.admission.active_connections());

    let secret_key = new_secret_key();
    let mut session = Session::new(
        SessionId(session_id),
        secret_key,
        cluster.txn_manager.clone(),
        config,
    );
    session.user = params.get("user").cloned().unwrap_or_default();
    session.database = params
        .get("database")
        .cloned()
        .unwrap_or_else(|| session.user.clone());
    cancel_registry.insert(
        session_id,
        CancelEntry {
            secret_key,
            interrupts: session.interrupts.clone(),
        },
    );

    let mut handshake = vec![BackendMessage::AuthenticationOk];
    for (name, value) in [
        ("server_version", "15.0"),
        ("server_encoding", "UTF8"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
        ("integer_datetimes", "on"),
        ("standard_conforming_strings", "on"),
    ] {
        handshake.push(BackendMessage::ParameterStatus {
            name: name.into(),
            value: value.into(),
        });
    }
    handshake.push(BackendMessage::BackendKeyData {
        process_id: session_id,
        secret_key,
    });
    let mut backend = Backend::new(cluster, session);
    backend.ready_for_query();
    handshake.extend(backend.take_output());
    send_messages(&mut stream, &handshake).await?;

    // Phase 2: message loop. Everything decoded from one read is handled
    // before the replies go out in a single write.
    loop {
        let mut msgs = Vec::new();
        let mut framing_error = None;
        loop {
            match codec::decode_message(&mut buf, max_len) {
                Ok(Some(msg)) => msgs.push(msg),
                Ok(None) => break,
                Err(e) => {
                    framing_error = Some(e);
                    break;
                }
            }
        }

        if !msgs.is_empty() || framing_error.is_some() {
            let (returned, flow) = tokio::task::spawn_blocking(move || {
                let mut flow = Flow::Continue;
                for msg in msgs {
                    flow = backend.handle_message(msg);
                    if flow == Flow::Terminate {
                        break;
                    }
                }
                if flow == Flow::Continue {
                    if let Some(e) = framing_error {
                        backend.fatal(e.into());
                        flow = Flow::Terminate;
                    }
                }
                (backend, flow)
            })
            .await?;
            backend = returned;
            let out = backend.take_output();
            send_messages(&mut stream, &out).await?;
            if flow == Flow::Terminate {
                return Ok(());
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!(session_id, "client disconnected");
                backend.terminate();
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                backend.terminate();
                return Err(e.into());
            }
        }
    }
}

async fn send_messages(stream: &mut TcpStream, msgs: &[BackendMessage]) -> std::io::Result<()> {
    if msgs.is_empty() {
        return Ok(());
    }
    let mut buf = BytesMut::new();
    for msg in msgs {
        codec::encode_into(&mut buf, msg);
    }
    stream.write_all(&buf).await?;
    stream.flush().await
}
