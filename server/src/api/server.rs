//! API server initialization

use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::routes;
use crate::core::CoreApp;

pub struct ApiServer {
    app: CoreApp,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        Self { app }
    }

    /// Serve until the shutdown signal fires; returns CoreApp for teardown
    pub async fn start(self) -> Result<CoreApp> {
        let app = self.app;

        let host = app.config.server.host.clone();
        let port = app.config.server.port;
        let addr = SocketAddr::new(host.parse()?, port);

        let router = routes::routes(app.bus.clone(), app.shutdown.clone())
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(
            address = %addr,
            backend = app.bus.backend_name(),
            "message bus listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(app.shutdown.wait())
            .await?;

        Ok(app)
    }
}
