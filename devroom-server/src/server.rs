//! Server assembly: builds the components from [`ServerConfig`] and serves
//! the HTTP router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use devroom_agent::{DirectiveGenerator, GeminiClient, GenerativeModel, PersonaConfig, UnconfiguredModel};
use devroom_sandbox::{LocalRuntimeFactory, RuntimeFactory, SandboxConfig, SandboxController};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::gate::{MemoryRevocationStore, SessionGate};
use crate::store::TreeStore;
use crate::web::{self, AppState};

pub struct Server {
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
}

impl Server {
    /// Production wiring: Gemini (if a key is set) and host-directory sandboxes.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let model: Arc<dyn GenerativeModel> = match config.gemini_api_key.clone() {
            Some(key) if !key.is_empty() => Arc::new(GeminiClient::new(key)),
            _ => {
                tracing::warn!("GEMINI_API_KEY not set: AI turns will fail");
                Arc::new(UnconfiguredModel)
            }
        };
        let runtimes = Arc::new(
            LocalRuntimeFactory::new(config.sandbox_root.clone())
                .with_public_host(&config.preview_host),
        );
        Self::with_components(config, model, runtimes)
    }

    /// Wire the server with an explicit model and sandbox runtime.
    pub fn with_components(
        config: ServerConfig,
        model: Arc<dyn GenerativeModel>,
        runtimes: Arc<dyn RuntimeFactory>,
    ) -> Result<Self> {
        if config.jwt_secret.is_empty() {
            anyhow::bail!("DEVROOM_JWT_SECRET must not be empty");
        }
        let store = match &config.db_path {
            Some(path) => TreeStore::open(path)
                .with_context(|| format!("opening tree store {}", path.display()))?,
            None => TreeStore::open_memory().context("opening in-memory tree store")?,
        };
        let gate = SessionGate::new(&config.jwt_secret, Arc::new(MemoryRevocationStore::new()));
        let persona = PersonaConfig::default()
            .with_model(&config.model)
            .with_temperature(config.temperature);
        let generator = DirectiveGenerator::new(model, persona);
        let sandboxes = SandboxController::new(
            runtimes,
            SandboxConfig {
                output_buffer_lines: config.output_buffer_lines,
            },
        );
        let coordinator = Arc::new(Coordinator::new(&config, gate, generator, sandboxes, store));
        Ok(Self { config, coordinator })
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Bind, start serving in the background and return the bound address.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;
        let republisher = self.coordinator.spawn_sandbox_republisher();
        let state = Arc::new(AppState {
            coordinator: self.coordinator,
            started: Instant::now(),
            cors_origins: self.config.cors_origins,
        });
        let router = web::router(state);
        tracing::info!("Listening on {addr}");

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router).await;
            republisher.abort();
            served.context("HTTP server failed")
        });
        Ok((addr, handle))
    }

    pub async fn run(self) -> Result<()> {
        let (_, handle) = self.start().await?;
        handle.await.context("server task panicked")?
    }
}
