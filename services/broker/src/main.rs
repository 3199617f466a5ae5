// Broker service main entry point.
mod observability;

use anyhow::Result;
use broker::config;
use broker::server::{self, BrokerServer};
use std::future::Future;
use warden_auth::{KeySource, ProductionKeySource};

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("warden-broker");

    let config = config::BrokerConfig::from_env_or_yaml()?;
    let keys = KeySource::Production(ProductionKeySource {
        seed_file: config.server_seed_file.clone(),
    });
    // Keys are checked before any socket opens.
    let auth = server::build_authenticator(&config, &keys)?;
    let store = server::build_store(&config).await?;
    let broker = BrokerServer::bind(&config, auth, store).await?;
    tracing::info!(server_id = broker.server_id(), "broker started");

    // Expose Prometheus metrics on the configured bind address.
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        broker.store(),
        config.metrics_bind,
    ));

    // Runs until SIGINT.
    let result = broker.run(shutdown).await;
    metrics_task.abort();
    tracing::info!("broker stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn local_env() -> Vec<EnvGuard> {
        vec![
            EnvGuard::set("WARDEN_LISTEN_BIND", "127.0.0.1:0"),
            EnvGuard::set("WARDEN_BROKER_METRICS_BIND", "127.0.0.1:0"),
            EnvGuard::unset("WARDEN_BROKER_CONFIG"),
            EnvGuard::unset("WARDEN_STORE_BACKEND"),
            EnvGuard::unset("WARDEN_SERVER_SEED_FILE"),
            EnvGuard::unset("WARDEN_ALLOWED_KEYS"),
        ]
    }

    #[tokio::test]
    #[serial]
    async fn run_with_shutdown_memory_backend() -> Result<()> {
        let _env = local_env();
        let _g = EnvGuard::unset("WARDEN_TRUSTED_KEYS");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn invalid_trusted_key_fails_startup() {
        let _env = local_env();
        let _g = EnvGuard::set("WARDEN_TRUSTED_KEYS", "not-a-key");
        let err = run_with_shutdown(async {}).await.expect_err("bad key");
        assert!(format!("{err:#}").contains("trusted"));
    }

    #[tokio::test]
    #[serial]
    async fn missing_seed_file_fails_startup() {
        let _env = local_env();
        let _g1 = EnvGuard::unset("WARDEN_TRUSTED_KEYS");
        let _g2 = EnvGuard::set("WARDEN_SERVER_SEED_FILE", "/nonexistent/server.seed");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
