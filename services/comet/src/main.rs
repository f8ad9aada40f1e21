// Comet node entry point.
mod observability;

use anyhow::{Context, Result};
use comet::config::CometConfig;
use comet::membership::{HttpMembership, Membership, watch_membership};
use comet::transport::{tcp, websocket};
use comet::{CometNode, rpc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(3);

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
    let metrics_handle = observability::init_observability("comet");

    let config = CometConfig::from_env_or_yaml()?;
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let node = CometNode::from_config(config.clone()).context("build comet node")?;
    tracing::info!(
        node = %node.node_id(),
        kind = %config.channel_kind,
        nodes = ?config.nodes,
        "comet started"
    );

    let tcp_listener = TcpListener::bind(config.tcp_bind)
        .await
        .context("bind tcp listener")?;
    tracing::info!(addr = %tcp_listener.local_addr()?, "tcp listener started");
    let ws_listener = TcpListener::bind(config.websocket_bind)
        .await
        .context("bind websocket listener")?;
    tracing::info!(addr = %ws_listener.local_addr()?, "websocket listener started");
    let admin_listener = TcpListener::bind(config.admin_bind)
        .await
        .context("bind admin listener")?;
    tracing::info!(addr = %admin_listener.local_addr()?, "admin listener started");

    let mut tasks = Vec::new();
    {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = tcp::serve(tcp_listener, node).await {
                tracing::warn!(error = %err, "tcp accept loop exited");
            }
        }));
    }
    {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = websocket::serve(ws_listener, node).await {
                tracing::warn!(error = %err, "websocket server exited");
            }
        }));
    }
    {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = rpc::serve(admin_listener, node).await {
                tracing::warn!(error = %err, "admin server exited");
            }
        }));
    }

    if let Some(url) = config.membership_url.as_deref() {
        let membership: Arc<dyn Membership> =
            Arc::new(HttpMembership::new(url, MEMBERSHIP_TIMEOUT)?);
        let interval = Duration::from_millis(config.membership_poll_ms);
        tasks.push(tokio::spawn(watch_membership(
            node.clone(),
            membership,
            interval,
        )));
    } else {
        tracing::info!("membership watcher disabled (COMET_MEMBERSHIP_URL not set)");
    }

    shutdown.await;
    for task in &tasks {
        task.abort();
    }
    let closed = node.registry.close_all();
    tracing::info!(channels = closed, "comet stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode};
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

    fn loopback_binds() -> Vec<EnvGuard> {
        vec![
            EnvGuard::set("COMET_TCP_BIND", "127.0.0.1:0"),
            EnvGuard::set("COMET_WS_BIND", "127.0.0.1:0"),
            EnvGuard::set("COMET_ADMIN_BIND", "127.0.0.1:0"),
            EnvGuard::set("COMET_METRICS_BIND", "127.0.0.1:0"),
            EnvGuard::unset("COMET_CONFIG"),
            EnvGuard::unset("COMET_CHANNEL_KIND"),
            EnvGuard::unset("COMET_NODES"),
            EnvGuard::unset("COMET_NODE_ID"),
        ]
    }

    async fn start_error_server() -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR });
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        Ok(format!("http://{}", addr))
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn run_with_shutdown_without_membership() -> Result<()> {
        let _binds = loopback_binds();
        let _g = EnvGuard::unset("COMET_MEMBERSHIP_URL");
        run_with_shutdown(async {}).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn run_with_shutdown_survives_failing_membership() -> Result<()> {
        let _binds = loopback_binds();
        let base_url = start_error_server().await?;
        let _g1 = EnvGuard::set("COMET_MEMBERSHIP_URL", &base_url);
        let _g2 = EnvGuard::set("COMET_MEMBERSHIP_POLL_MS", "10");
        run_with_shutdown(tokio::time::sleep(Duration::from_millis(50))).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    #[serial]
    async fn invalid_config_fails_startup() {
        let _binds = loopback_binds();
        let _g = EnvGuard::set("COMET_CHANNEL_BUCKETS", "3");
        assert!(run_with_shutdown(async {}).await.is_err());
    }
}
