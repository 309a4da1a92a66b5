use clap::Parser;
use std::net::SocketAddr;

/// CLI arguments for the signaling relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "sigrelay")]
#[command(about = "Room-scoped WebRTC signaling relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "SIGRELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Listen port override. Hosting platforms hand out the port this way.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SIGRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "SIGRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "SIGRELAY_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Capacity of each connection's outbound delivery queue.
    #[arg(long, default_value = "64", env = "SIGRELAY_SEND_QUEUE")]
    pub send_queue_depth: usize,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_payload: usize,
    /// Capacity of each connection's outbound delivery queue.
    pub send_queue_depth: usize,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first value found out of bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        const MAX_ALLOWED_PAYLOAD: usize = 16_777_216;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_PAYLOAD
            ));
        }

        if self.send_queue_depth == 0 {
            return Err("send_queue_depth must be greater than 0".to_string());
        }
        if self.send_queue_depth > 65_536 {
            return Err("send_queue_depth exceeds reasonable limit (65,536)".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let mut listen = args.listen;
        if let Some(port) = args.port {
            listen.set_port(port);
        }
        Self {
            listen,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_payload: args.max_payload,
            send_queue_depth: args.send_queue_depth,
        }
    }
}
