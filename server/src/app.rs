//! Core application

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::api::ApiServer;
use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::ENV_LOG;
use crate::core::shutdown::ShutdownService;
use crate::data::backlog;
use crate::domain::bus::{BusHooks, MessageBus};

pub struct CoreApp {
    pub config: AppConfig,
    pub shutdown: ShutdownService,
    pub bus: MessageBus,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        match command {
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    fn init_logging() {
        let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;

        let backend = backlog::from_config(&config.backlog)
            .await
            .context("Failed to initialize backlog backend")?;
        tracing::debug!(backend = backend.backend_name(), "Backlog backend ready");

        let shutdown = ShutdownService::new();
        let bus = MessageBus::new(config.bus.clone(), backend, BusHooks::default());
        bus.start(shutdown.clone()).await;

        Ok(Self {
            config,
            shutdown,
            bus,
        })
    }

    async fn start_server(app: CoreApp) -> Result<()> {
        app.shutdown.install_signal_handlers();

        let server = ApiServer::new(app);
        let app = server.start().await?;

        // The listener returned; tear down in order: background tasks first,
        // then the bus (sentinel + subscriber join)
        app.shutdown.shutdown().await;
        app.bus.destroy().await;

        Ok(())
    }
}
