use clap::Parser;
use deferral::config::{DEFAULT_BASE_PORT, DEFAULT_PORT_STRIDE, DEFAULT_TASK_QUEUE};
use deferral::{logging, Bootstrap, BootstrapError, NodeConfig};
use slog::{error, info, warn, Level, Logger};
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "deferral")]
#[command(about = "Coordinator, worker and client roles for queue-dispatched workflows", long_about = None)]
struct Args {
    /// Node number; also selects the frontend port
    #[arg(short, long, default_value_t = 1)]
    node_id: u64,

    /// Address the coordinator listens on
    #[arg(short, long, default_value = "127.0.0.1")]
    listen: IpAddr,

    /// Frontend port of node 1
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Port distance between consecutive node ids
    #[arg(long, default_value_t = DEFAULT_PORT_STRIDE)]
    port_stride: u16,

    /// Cluster id to report; generated when omitted
    #[arg(long)]
    cluster_id: Option<Uuid>,

    #[arg(short, long, default_value = DEFAULT_TASK_QUEUE)]
    task_queue: String,

    /// Seconds dependents wait for the coordinator; unbounded when omitted
    #[arg(long)]
    readiness_timeout: Option<u64>,

    /// Seconds to wait for roles to stop before aborting them
    #[arg(long, default_value_t = 10)]
    shutdown_grace: u64,

    /// Maximum workflow tasks the worker runs at once
    #[arg(long, default_value_t = 16)]
    max_concurrent_workflow_tasks: usize,

    /// Maximum activities the worker runs at once
    #[arg(long, default_value_t = 16)]
    max_concurrent_activities: usize,

    /// Log level (critical, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: Level,
}

fn parse_level(name: &str) -> Result<Level, String> {
    name.parse()
        .map_err(|_| format!("unknown log level '{}'", name))
}

impl Args {
    fn to_config(&self) -> NodeConfig {
        let mut config = NodeConfig::new(self.node_id)
            .with_listen_ip(self.listen)
            .with_base_port(self.base_port)
            .with_port_stride(self.port_stride)
            .with_task_queue(self.task_queue.clone())
            .with_shutdown_grace(Duration::from_secs(self.shutdown_grace));
        if let Some(cluster_id) = self.cluster_id {
            config = config.with_cluster_id(cluster_id);
        }
        if let Some(secs) = self.readiness_timeout {
            config = config.with_readiness_timeout(Duration::from_secs(secs));
        }
        config.worker.max_concurrent_workflow_tasks = self.max_concurrent_workflow_tasks;
        config.worker.max_concurrent_activities = self.max_concurrent_activities;
        config
    }
}

/// Resolve once `signal` fires. A signal handler that could not be
/// installed is logged and never resolves, so the node keeps running.
async fn interrupted<F>(signal: F, logger: &Logger)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(logger, "Failed to listen for Ctrl+C"; "error" => %e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let logger = logging::terminal(args.log_level);
    let config = args.to_config();

    let (bootstrap, _client) = match Bootstrap::standard(&config, logger.clone(), None) {
        Ok(assembled) => assembled,
        Err(e) => {
            error!(logger, "Invalid configuration"; "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    let handle = match bootstrap.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!(logger, "Failed to start roles"; "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    let stopped_early = tokio::select! {
        ready = handle.ready() => {
            match ready {
                Ok(()) => info!(logger, "Node ready, press Ctrl+C to shut down";
                    "identity" => config.identity()),
                Err(e) => warn!(logger, "Node did not become ready"; "error" => %e),
            }
            false
        }
        _ = interrupted(tokio::signal::ctrl_c(), &logger) => true,
    };

    if !stopped_early {
        // A failing coordinator cancels the token on its own.
        let shutdown = handle.shutdown_token();
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = interrupted(tokio::signal::ctrl_c(), &logger) => {}
        }
    }
    handle.shutdown();

    let code = match handle.join_with_grace(config.shutdown_grace).await {
        Ok(report) => {
            for exit in report.failures() {
                if let Err(e) = &exit.outcome {
                    warn!(logger, "Role exited with error";
                        "role" => exit.kind.as_str(),
                        "identity" => &exit.name,
                        "error" => %e
                    );
                }
            }
            info!(logger, "Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e @ BootstrapError::CoordinatorFailed { .. }) => {
            error!(logger, "Coordinator failed"; "error" => %e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(logger, "Shutdown did not complete cleanly"; "error" => %e);
            ExitCode::FAILURE
        }
    };

    // Give the async drain a moment to flush.
    drop(logger);
    tokio::time::sleep(Duration::from_millis(50)).await;
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interrupted_on_signal() {
        let logger = logging::discard();
        tokio::time::timeout(Duration::from_secs(1), interrupted(async { Ok(()) }, &logger))
            .await
            .expect("Signal should interrupt");
    }

    #[tokio::test]
    async fn test_failed_signal_handler_does_not_interrupt() {
        let logger = logging::discard();
        let failed = async { Err(io::Error::new(io::ErrorKind::Other, "no signal support")) };
        let waited =
            tokio::time::timeout(Duration::from_millis(100), interrupted(failed, &logger)).await;
        assert!(waited.is_err(), "a failed handler must not count as Ctrl+C");
    }

    #[test]
    fn test_args_map_onto_config() {
        let args = Args::parse_from([
            "deferral",
            "--node-id",
            "3",
            "--max-concurrent-workflow-tasks",
            "2",
            "--max-concurrent-activities",
            "5",
        ]);
        let config = args.to_config();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.worker.max_concurrent_workflow_tasks, 2);
        assert_eq!(config.worker.max_concurrent_activities, 5);
    }
}
