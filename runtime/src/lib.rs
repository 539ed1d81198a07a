//! edgeproxy runtime - process wiring for the ingestion proxy
//!
//! Provides [`run()`] for the default process, and [`RuntimeBuilder`] when
//! the listen addresses or the stage chain need to be changed in code.
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     edgeproxy_runtime::run().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;
pub mod server;

use anyhow::Context;
use edgeproxy_gateway::config::{Config, FileConfig, LogFormat};
use edgeproxy_gateway::proxy::KafkaProxy;
use edgeproxy_gateway::stage::{ConfiguredStages, StageFactory};
use prometheus::Registry;
use server::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run the proxy with settings from the environment and the config file
pub async fn run() -> anyhow::Result<()> {
    RuntimeBuilder::new().run().await
}

/// Builder for controlling runtime behaviour
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .listen_addr("127.0.0.1:18080".parse()?)
///     .stage(Arc::new(MyStage::new()))
///     .run()
///     .await
/// ```
#[derive(Default)]
pub struct RuntimeBuilder {
    listen_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
    extra_stages: Vec<Arc<dyn StageFactory>>,
}

impl RuntimeBuilder {
    /// Create a builder; unset values come from the environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the ingestion listen address (`EDGEPROXY_LISTEN_ADDR`)
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Override the metrics listen address (`EDGEPROXY_METRICS_ADDR`)
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Append a stage after the configured ones
    pub fn stage(mut self, factory: Arc<dyn StageFactory>) -> Self {
        self.extra_stages.push(factory);
        self
    }

    /// Load configuration, start both listeners and serve until a shutdown
    /// signal arrives
    pub async fn run(self) -> anyhow::Result<()> {
        let config = Config::from_env()?;
        init_tracing(&config);

        let file = match &config.config_path {
            Some(path) => FileConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => FileConfig::default(),
        };

        let registry = Registry::new();
        let proxy = KafkaProxy::from_config(&file.proxy, Some(&registry))?;
        let configured = ConfiguredStages::from_config(
            &file.stages,
            &file.proxy.invalid_messages_topic,
            Some(&registry),
        )?;

        let mut stages = configured.chain();
        for factory in self.extra_stages {
            stages.add(factory);
        }

        let listen_addr = self.listen_addr.unwrap_or(config.listen_addr);
        let metrics_addr = self.metrics_addr.unwrap_or(config.metrics_addr);
        info!(
            %listen_addr,
            %metrics_addr,
            url = %file.proxy.url,
            stages = ?stages.names(),
            "starting edgeproxy"
        );

        let state = AppState {
            proxy: Arc::new(proxy),
            stages,
            decoder: config.decoder,
            registry,
        };

        let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
            .await
            .with_context(|| format!("binding metrics listener {metrics_addr}"))?;
        let metrics_app = server::metrics_router(state.clone());
        let metrics_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
                error!(error = %e, "metrics server error");
            }
        });

        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;
        info!(%listen_addr, "ingestion server listening");
        axum::serve(listener, server::router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        metrics_task.abort();
        info!("edgeproxy shutdown complete");
        Ok(())
    }
}

/// Initialise the tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
