use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use ironhold_common::shutdown::shutdown_signal;
use ironhold_core::executor::Executor;
use ironhold_core::facade::Facade;
use ironhold_core::fanout::{EventBus, LogBus};
use ironhold_core::plan::PlanRegistry;
use ironhold_core::store::Store;
use ironhold_provider_fake::FakeProvider;
use ironhold_proto::pb::operation_service_server::OperationServiceServer;
use ironhold_proto::OperationServiceImpl;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::args::ServerArgs;

/// Wires Store, fan-out buses, plan registry, provider, executor, and
/// façade into one gRPC server — mirrors `storage/src/server.rs`'s
/// `Server::builder().add_service(...).serve_with_shutdown(...)` shape,
/// trading its NATS JetStream dependency for this core's in-memory Store.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    let store = Store::new();
    let events = EventBus::new();
    let logs = LogBus::new();
    let plans = Arc::new(PlanRegistry::with_builtins());

    // The fake provider is the only reference implementation shipped with
    // this core; a real deployment swaps it for a backend-specific
    // `Provider` at this single wiring point.
    let provider = Arc::new(FakeProvider::new());
    let executor = Arc::new(Executor::new(store.clone(), events.clone(), logs.clone(), plans, provider));
    let facade = Facade::new(store, events, logs, executor.clone());

    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", args.grpc_port).parse()?;
    tracing::info!(%grpc_addr, "starting operations server");

    let cancel = CancellationToken::new();
    let service = OperationServiceImpl::new(facade);
    let server_cancel = cancel.clone();
    let grpc_server = Server::builder()
        .add_service(OperationServiceServer::new(service))
        .serve_with_shutdown(grpc_addr, async move {
            server_cancel.cancelled().await;
        });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    ironhold_common::signal_ready();
    grpc_server.await?;
    executor.shutdown();
    tracing::info!("server stopped gracefully");
    Ok(())
}
