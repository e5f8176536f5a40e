use std::sync::Arc;

use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use fedlink_core::state::LinkState;
use fedlink_core::state_sqlite::SqliteState;
use fedlink_server::driver::DriverService;
use fedlink_server::exec::ExecService;
use fedlink_server::executor::SubprocessExecutor;
use fedlink_server::fab::DiskFabProvider;
use fedlink_server::fleet::FleetService;
use fedlink_server::grpc::proto::driver_server::DriverServer;
use fedlink_server::grpc::proto::exec_server::ExecServer;
use fedlink_server::grpc::proto::fleet_server::FleetServer;
use fedlink_server::GRPC_MAX_MESSAGE_LENGTH;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let database_path = parse_database_path();
    let state = SqliteState::new(&database_path).await?;
    state.init().await?;
    tracing::info!(%database_path, "link state ready");
    let state: Arc<dyn LinkState> = Arc::new(state);

    let driver_addr = "0.0.0.0:9091".parse()?;
    let fleet_addr = "0.0.0.0:9092".parse()?;
    let exec_addr = "0.0.0.0:9093".parse()?;

    let fabs = Arc::new(DiskFabProvider::from_env());
    let executor = Arc::new(SubprocessExecutor::new(state.clone(), parse_run_command())?);

    let driver = DriverServer::new(DriverService::new(state.clone()))
        .max_decoding_message_size(GRPC_MAX_MESSAGE_LENGTH)
        .max_encoding_message_size(GRPC_MAX_MESSAGE_LENGTH);
    let fleet = FleetServer::new(FleetService::new(state.clone(), fabs))
        .max_decoding_message_size(GRPC_MAX_MESSAGE_LENGTH)
        .max_encoding_message_size(GRPC_MAX_MESSAGE_LENGTH);
    let exec = ExecServer::new(ExecService::new(executor))
        .max_decoding_message_size(GRPC_MAX_MESSAGE_LENGTH)
        .max_encoding_message_size(GRPC_MAX_MESSAGE_LENGTH);

    tracing::info!(%driver_addr, %fleet_addr, %exec_addr, "link server listening");

    tokio::try_join!(
        Server::builder().add_service(driver).serve(driver_addr),
        Server::builder().add_service(fleet).serve(fleet_addr),
        Server::builder().add_service(exec).serve(exec_addr),
    )?;

    Ok(())
}

/// Database path resolution: `--database-path <path>` CLI arg, then
/// the `DATABASE_PATH` env var, then an in-memory database.
fn parse_database_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    if let Some(path) = args
        .windows(2)
        .find(|w| w[0] == "--database-path")
        .map(|w| w[1].clone())
    {
        return path;
    }
    std::env::var("DATABASE_PATH").unwrap_or_else(|_| ":memory:".to_string())
}

/// The command the exec surface spawns for each run: `--run-command`
/// CLI arg or the `FEDLINK_RUN_COMMAND` env var, split on whitespace.
fn parse_run_command() -> Vec<String> {
    let args: Vec<String> = std::env::args().collect();
    let raw = args
        .windows(2)
        .find(|w| w[0] == "--run-command")
        .map(|w| w[1].clone())
        .or_else(|| std::env::var("FEDLINK_RUN_COMMAND").ok())
        .unwrap_or_else(|| "fedlink-run".to_string());
    raw.split_whitespace().map(str::to_string).collect()
}
