//! Assembles the broker from configuration and runs it until shutdown.
use crate::config::{BrokerConfig, StorageBackend};
use crate::connections::ConnectionIndex;
use crate::diagnostics::LogThrottle;
use crate::listener::{self, ListenerContext, ListenerSettings};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use warden_auth::{Authenticator, KeyRole, KeySource};
use warden_liveness::{InMemoryLivenessStore, LivenessStore, PostgresLivenessStore, Reaper};

pub async fn build_store(config: &BrokerConfig) -> Result<Arc<dyn LivenessStore>> {
    let store: Arc<dyn LivenessStore> = match config.storage {
        StorageBackend::Memory => Arc::new(InMemoryLivenessStore::new()),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            Arc::new(
                PostgresLivenessStore::connect(pg)
                    .await
                    .context("connect postgres liveness store")?,
            )
        }
    };
    tracing::info!(
        backend = store.backend_name(),
        durable = store.is_durable(),
        "liveness store ready"
    );
    Ok(store)
}

pub fn build_authenticator(config: &BrokerConfig, keys: &KeySource) -> Result<Authenticator> {
    let server_key = keys.load(KeyRole::Operator).context("load server key")?;
    let auth = Authenticator::new(config.auth_config(), &server_key)
        .context("invalid auth configuration")?;
    tracing::info!(
        server_id = auth.server_id(),
        auth_required = auth.auth_required(),
        trusted_keys = auth.trusted_keys().len(),
        allowed_keys = config.allowed_keys.len(),
        "authenticator ready"
    );
    Ok(auth)
}

pub struct BrokerServer {
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    reaper: Reaper,
}

impl BrokerServer {
    /// Validate the remaining settings, then bind the client listener.
    ///
    /// Nothing is bound if any setting is rejected.
    pub async fn bind(
        config: &BrokerConfig,
        auth: Authenticator,
        store: Arc<dyn LivenessStore>,
    ) -> Result<Self> {
        let reaper = Reaper::new(Arc::clone(&store), config.reaper_config())
            .context("invalid reaper configuration")?;
        let auth_log = LogThrottle::new(
            "auth",
            config.diagnostic_capacity,
            config.diagnostic_window(),
        )
        .context("invalid diagnostic rate limit")?;
        let store_log = LogThrottle::new(
            "store",
            config.diagnostic_capacity,
            config.diagnostic_window(),
        )
        .context("invalid diagnostic rate limit")?;
        let accept_log = LogThrottle::new(
            "accept",
            config.diagnostic_capacity,
            config.diagnostic_window(),
        )
        .context("invalid diagnostic rate limit")?;
        let ctx = Arc::new(ListenerContext::new(
            auth,
            store,
            Arc::new(ConnectionIndex::new()),
            ListenerSettings {
                handshake_timeout: config.handshake_timeout(),
                max_line_bytes: config.max_line_bytes,
            },
            auth_log,
            store_log,
            accept_log,
        ));
        let listener = TcpListener::bind(config.listen_bind)
            .await
            .with_context(|| format!("bind client listener on {}", config.listen_bind))?;
        Ok(Self {
            listener,
            ctx,
            reaper,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    pub fn connections(&self) -> Arc<ConnectionIndex> {
        Arc::clone(&self.ctx.connections)
    }

    pub fn store(&self) -> Arc<dyn LivenessStore> {
        Arc::clone(&self.ctx.store)
    }

    pub fn server_id(&self) -> &str {
        self.ctx.auth.server_id()
    }

    /// Accept clients and sweep liveness records until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            listener,
            ctx,
            reaper,
        } = self;
        tracing::info!(addr = %listener.local_addr()?, "client listener started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let reaper_task = tokio::spawn(reaper.run(wait_for_stop(stop_rx)));

        tokio::select! {
            _ = listener::serve(listener, Arc::clone(&ctx)) => {}
            _ = shutdown => {}
        }

        let _ = stop_tx.send(true);
        if let Err(err) = reaper_task.await {
            tracing::warn!(error = %err, "reaper task failed");
        }
        let (_, handles) = ctx.connections.snapshot();
        for handle in &handles {
            handle.close();
        }
        tracing::info!(open_connections = handles.len(), "client listener stopped");
        Ok(())
    }
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
