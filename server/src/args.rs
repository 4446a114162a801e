use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    Server(ServerArgs),
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// gRPC port for the OperationService.
    #[arg(long, env = "GRPC_PORT", default_value_t = 7700)]
    pub grpc_port: u16,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    /// HTTP port to listen on for health checks.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// gRPC target address of the operations server to health check.
    #[arg(long, env = "GRPC_TARGET", default_value = "http://127.0.0.1:7700")]
    pub grpc_target: String,
}
