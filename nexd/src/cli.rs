//! Command-line surface (spec §6). Every flag has a matching `NEXD_<UPPER_SNAKE>` environment
//! variable via clap's `env` feature, the same idiom the teacher's headless client `Cli` uses.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ip_network::IpNetwork;
use url::Url;

#[derive(Parser)]
#[command(name = "nexd", author, version, about = "Overlay mesh node agent", long_about = None)]
pub struct Cli {
    /// Controller base URL this node registers and reconciles against.
    pub controller_url: Url,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// This node's public key, base64. Derived from the private key if omitted.
    #[arg(long, env = "NEXD_PUBLIC_KEY")]
    pub public_key: Option<String>,

    /// This node's private key, base64. Generated and persisted under `state-dir` if omitted.
    #[arg(long, env = "NEXD_PRIVATE_KEY")]
    pub private_key: Option<String>,

    /// UDP port the tunnel listens on. 0 lets the OS pick an ephemeral port.
    #[arg(long, env = "NEXD_LISTEN_PORT", default_value_t = 0)]
    pub listen_port: u16,

    /// Requests a specific overlay IP from the controller instead of an assigned one.
    #[arg(long, env = "NEXD_REQUEST_IP")]
    pub request_ip: Option<IpAddr>,

    /// Declares this node's public endpoint explicitly, skipping STUN discovery.
    #[arg(long, env = "NEXD_LOCAL_ENDPOINT_IP")]
    pub local_endpoint_ip: Option<SocketAddr>,

    /// Additional CIDR this node routes on behalf of others. Repeatable.
    #[arg(long = "child-prefix", env = "NEXD_CHILD_PREFIX")]
    pub child_prefix: Vec<IpNetwork>,

    /// Discover this node's reflexive address via STUN when no explicit endpoint is given.
    #[arg(long, env = "NEXD_STUN", default_value_t = false)]
    pub stun: bool,

    /// Advertises this node as willing to relay traffic for peers that cannot connect directly.
    #[arg(long, env = "NEXD_RELAY_NODE", default_value_t = false)]
    pub relay_node: bool,

    /// Advertises this node as an endpoint-discovery helper for other peers.
    #[arg(long, env = "NEXD_DISCOVERY_NODE", default_value_t = false)]
    pub discovery_node: bool,

    /// Never attempt a direct path to any peer; always route through a relay.
    #[arg(long, env = "NEXD_RELAY_ONLY", default_value_t = false)]
    pub relay_only: bool,

    /// Controller login username.
    #[arg(long, env = "NEXD_USERNAME", default_value = "")]
    pub username: String,

    /// Controller login password.
    #[arg(long, env = "NEXD_PASSWORD", default_value = "")]
    pub password: String,

    /// Skip TLS certificate verification against the controller. Development use only.
    #[arg(long, env = "NEXD_INSECURE_SKIP_TLS_VERIFY", default_value_t = false)]
    pub insecure_skip_tls_verify: bool,

    /// Directory holding the private key, proxy rules file, device snapshot and control socket.
    #[arg(long, env = "NEXD_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Runs in userspace-proxy mode: no kernel tunnel interface, traffic flows through
    /// explicitly registered ingress/egress rules instead.
    Proxy {
        /// `<protocol>:<listen_port>:<destination_ip>:<destination_port>`. Repeatable.
        #[arg(long = "ingress")]
        ingress: Vec<String>,

        /// `<protocol>:<listen_port>:<destination_ip>:<destination_port>`. Repeatable.
        #[arg(long = "egress")]
        egress: Vec<String>,
    },

    /// Prints the build version and exits.
    Version,
}

impl Cli {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// Fatal argument-combination check (spec §6): `child-prefix`, `relay-node` and
    /// `discovery-node` only make sense for a node with a real kernel tunnel.
    pub fn validate(&self) -> Result<(), nexd_core::ConfigError> {
        if matches!(self.command, Some(Command::Proxy { .. })) {
            if !self.child_prefix.is_empty() {
                return Err(nexd_core::ConfigError::IncompatibleWithProxy { flag: "child-prefix" });
            }
            if self.relay_node {
                return Err(nexd_core::ConfigError::IncompatibleWithProxy { flag: "relay-node" });
            }
            if self.discovery_node {
                return Err(nexd_core::ConfigError::IncompatibleWithProxy { flag: "discovery-node" });
            }
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nexd")
}
