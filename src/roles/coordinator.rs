use crate::bootstrap::{Role, RoleContext, RoleError, RoleKind};
use crate::engine::{Engine, EngineOptions, EngineServer};
use async_trait::async_trait;
use slog::{error, info, o};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

/// Hosts the engine and its HTTP front-end.
///
/// Opens the readiness gate once the listener is bound, and not before.
pub struct CoordinatorRole {
    identity: String,
    address: SocketAddr,
    cluster_id: Uuid,
    engine_options: EngineOptions,
}

impl CoordinatorRole {
    pub fn new(identity: String, address: SocketAddr, cluster_id: Uuid) -> Self {
        Self {
            identity,
            address,
            cluster_id,
            engine_options: EngineOptions::default(),
        }
    }

    pub fn with_engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }
}

#[async_trait]
impl Role for CoordinatorRole {
    fn name(&self) -> String {
        self.identity.clone()
    }

    fn kind(&self) -> RoleKind {
        RoleKind::Coordinator
    }

    async fn run(self: Box<Self>, ctx: RoleContext) -> Result<(), RoleError> {
        let CoordinatorRole {
            identity,
            address,
            cluster_id,
            engine_options,
        } = *self;
        let logger = ctx.logger().clone();
        info!(logger, "Starting engine front-end";
            "address" => %address,
            "cluster_id" => %cluster_id
        );

        let listener = TcpListener::bind(address).await.map_err(|source| {
            error!(logger, "Failed to bind engine front-end"; "error" => %source);
            RoleError::Bind { address, source }
        })?;
        let local_addr = listener.local_addr().map_err(RoleError::Server)?;

        // The engine stops with the role even if the process keeps running.
        let shutdown = ctx.shutdown().child_token();
        let engine = Arc::new(Engine::new(
            engine_options,
            shutdown.clone(),
            logger.new(o!("component" => "engine")),
        ));
        let reaper = tokio::spawn(engine.clone().run_reaper());
        let server = EngineServer::new(engine, identity, cluster_id, logger.clone());

        if ctx.gate().signal() {
            info!(logger, "Coordinator ready"; "address" => %local_addr);
        }

        let served = server.serve(listener, shutdown.clone()).await;
        shutdown.cancel();
        if let Err(e) = reaper.await {
            error!(logger, "Engine reaper ended abnormally"; "error" => %e);
        }

        served.map_err(|e| {
            error!(logger, "Engine front-end failed"; "error" => %e);
            RoleError::Server(e)
        })
    }
}
