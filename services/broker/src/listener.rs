//! Client listener: accept loop, handshake, heartbeats.
//!
//! # Connection lifecycle
//! 1. Accept, assign a connection id, send `INFO` with the server hello.
//! 2. Wait up to the handshake deadline for `CONNECT`. `PING` is answered
//!    while waiting; anything else ends the connection.
//! 3. Verify the challenge. Failures get one generic `-ERR` and a close.
//! 4. On success, persist an active connection record, register the handle
//!    in the live-connection index, reply `+OK`.
//! 5. Each `PING` refreshes the persisted heartbeat. If the reaper already
//!    retired the record the client is told it is stale and dropped.
//! 6. On exit only the index entry is removed. The persisted record stops
//!    receiving heartbeats, and the reaper retires it along with the
//!    producers and consumers it owns.
use crate::connections::{ConnectionHandle, ConnectionIndex, Registration};
use crate::diagnostics::LogThrottle;
use crate::protocol::{
    self, ClientOp, ERR_AUTH_TIMEOUT, ERR_AUTHORIZATION, ERR_STALE, ERR_UNAVAILABLE,
    ERR_UNKNOWN_OP, OK, PONG, ProtocolError,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use warden_auth::{Authenticator, Challenge, ConnectRequest, Identity};
use warden_liveness::{ConnectionRecord, LivenessStore, StoreError};

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub handshake_timeout: Duration,
    pub max_line_bytes: usize,
}

/// State shared by every connection task.
pub struct ListenerContext {
    pub auth: Authenticator,
    pub store: Arc<dyn LivenessStore>,
    pub connections: Arc<ConnectionIndex>,
    pub settings: ListenerSettings,
    pub(crate) auth_log: LogThrottle,
    pub(crate) store_log: LogThrottle,
    pub(crate) accept_log: LogThrottle,
}

impl ListenerContext {
    pub fn new(
        auth: Authenticator,
        store: Arc<dyn LivenessStore>,
        connections: Arc<ConnectionIndex>,
        settings: ListenerSettings,
        auth_log: LogThrottle,
        store_log: LogThrottle,
        accept_log: LogThrottle,
    ) -> Self {
        Self {
            auth,
            store,
            connections,
            settings,
            auth_log,
            store_log,
            accept_log,
        }
    }

    fn log_store_failure(&self, conn_id: &str, err: &StoreError, what: &'static str) {
        if let Some(suppressed) = self.store_log.admit() {
            tracing::warn!(conn_id = %conn_id, error = %err, suppressed, "{what} failed");
        }
    }
}

/// Pause after a failed `accept` so a descriptor shortage does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accept clients until the task is dropped. Accept failures are never fatal.
pub async fn serve(listener: TcpListener, ctx: Arc<ListenerContext>) {
    let listener = &listener;
    accept_loop(move || listener.accept(), ctx).await
}

async fn accept_loop<A, Fut>(mut accept: A, ctx: Arc<ListenerContext>)
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (stream, peer) = match accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                metrics::counter!("warden_accept_errors_total").increment(1);
                if let Some(suppressed) = ctx.accept_log.admit() {
                    tracing::warn!(error = %err, suppressed, "accept client failed");
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(ctx, stream, peer).await {
                tracing::debug!(%peer, error = %err, "client connection ended with error");
            }
        });
    }
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    max_line_bytes: usize,
}

impl Session {
    async fn send(&mut self, line: &str) -> Result<()> {
        protocol::write_line(&mut self.writer, line)
            .await
            .context("write to client")
    }

    async fn send_err(&mut self, message: &str) -> Result<()> {
        self.send(&protocol::err_line(message)).await
    }

    async fn next_op(&mut self) -> Result<Option<ClientOp>, ProtocolError> {
        match protocol::read_line(&mut self.reader, self.max_line_bytes).await? {
            Some(line) if line.trim().is_empty() => Ok(Some(ClientOp::Pong)),
            Some(line) => ClientOp::parse(&line).map(Some),
            None => Ok(None),
        }
    }
}

enum Handshake {
    Connect(ConnectRequest),
    Closed,
    TimedOut,
}

async fn handle_connection(
    ctx: Arc<ListenerContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (reader, writer) = stream.into_split();
    let mut session = Session {
        reader: BufReader::new(reader),
        writer,
        max_line_bytes: ctx.settings.max_line_bytes,
    };

    let mut challenge = ctx.auth.open(conn_id.clone());
    session.send(&protocol::info_line(challenge.hello())).await?;

    let request = match await_connect(&mut session, ctx.settings.handshake_timeout).await {
        Ok(Handshake::Connect(request)) => request,
        Ok(Handshake::Closed) => return Ok(()),
        Ok(Handshake::TimedOut) => {
            metrics::counter!("warden_auth_total", "outcome" => "timeout").increment(1);
            tracing::debug!(conn_id = %conn_id, %peer, "handshake deadline passed");
            return session.send_err(ERR_AUTH_TIMEOUT).await;
        }
        Err(err) => {
            let _ = session.send_err(ERR_UNKNOWN_OP).await;
            return Err(err.into());
        }
    };

    let identity = match authenticate(&ctx, &mut challenge, &request, peer) {
        Some(identity) => identity,
        None => return session.send_err(ERR_AUTHORIZATION).await,
    };

    if let Err(err) = ctx
        .store
        .upsert_connection(ConnectionRecord::active(&conn_id, Utc::now()))
        .await
    {
        ctx.log_store_failure(&conn_id, &err, "persist connection");
        return session.send_err(ERR_UNAVAILABLE).await;
    }
    let handle = ConnectionHandle::new(&conn_id, peer, identity);
    let Some(registration) = Registration::register(Arc::clone(&ctx.connections), handle.clone())
    else {
        anyhow::bail!("connection id {conn_id} already registered");
    };
    session.send(OK).await?;
    tracing::info!(
        conn_id = %conn_id,
        %peer,
        nkey = handle.identity.public_key().unwrap_or("anonymous"),
        "client connected"
    );

    let result = serve_session(&ctx, &mut session, &mut challenge, &handle).await;
    drop(registration);
    tracing::info!(conn_id = %conn_id, %peer, "client disconnected");
    result
}

async fn await_connect(
    session: &mut Session,
    deadline: Duration,
) -> Result<Handshake, ProtocolError> {
    let wait = async {
        loop {
            match session.next_op().await? {
                Some(ClientOp::Connect(request)) => {
                    return Ok::<_, ProtocolError>(Handshake::Connect(request));
                }
                Some(ClientOp::Ping) => {
                    protocol::write_line(&mut session.writer, PONG).await?;
                }
                Some(ClientOp::Pong) => {}
                None => return Ok(Handshake::Closed),
            }
        }
    };
    match tokio::time::timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => Ok(Handshake::TimedOut),
    }
}

fn authenticate(
    ctx: &ListenerContext,
    challenge: &mut Challenge,
    request: &ConnectRequest,
    peer: SocketAddr,
) -> Option<Identity> {
    match challenge.respond(request) {
        Ok(identity) => {
            metrics::counter!("warden_auth_total", "outcome" => "accepted").increment(1);
            Some(identity)
        }
        Err(failure) => {
            metrics::counter!(
                "warden_auth_total",
                "outcome" => "rejected",
                "reason" => failure.reason().as_str()
            )
            .increment(1);
            if let Some(suppressed) = ctx.auth_log.admit() {
                tracing::warn!(
                    conn_id = %challenge.conn_id(),
                    %peer,
                    reason = %failure.reason(),
                    suppressed,
                    "client authentication rejected"
                );
            }
            None
        }
    }
}

async fn serve_session(
    ctx: &ListenerContext,
    session: &mut Session,
    challenge: &mut Challenge,
    handle: &ConnectionHandle,
) -> Result<()> {
    let conn_id = handle.conn_id.as_str();
    loop {
        let op = tokio::select! {
            op = session.next_op() => op,
            _ = handle.closed() => {
                tracing::debug!(conn_id = %conn_id, "connection closed by server");
                return Ok(());
            }
        };
        match op {
            Ok(Some(ClientOp::Ping)) => {
                match ctx.store.record_heartbeat(conn_id, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) | Err(StoreError::NotFound(_)) => {
                        tracing::info!(conn_id = %conn_id, "heartbeat for retired connection");
                        return session.send_err(ERR_STALE).await;
                    }
                    // The client is alive; a missed write is caught up by the next PING.
                    Err(err) => ctx.log_store_failure(conn_id, &err, "record heartbeat"),
                }
                session.send(PONG).await?;
            }
            Ok(Some(ClientOp::Pong)) => {}
            Ok(Some(ClientOp::Connect(request))) => {
                // Anonymous sessions may repeat CONNECT; a bound identity is fixed.
                if authenticate(ctx, challenge, &request, handle.peer).is_none() {
                    return session.send_err(ERR_AUTHORIZATION).await;
                }
                session.send(OK).await?;
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                let _ = session.send_err(ERR_UNKNOWN_OP).await;
                return Err(err.into());
            }
        }
    }
}
