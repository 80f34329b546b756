//! `nexdctl`: operator CLI for the control RPC surface of a running `nexd` agent (spec §4.I).
//!
//! A thin client over the same length-prefixed JSON framing `nexd-rpc::server` speaks: connect
//! to the Unix socket, send one `Request`, print the `Response`, exit. No subcommand talks to
//! the controller or the data plane directly — everything goes through the running agent.

use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use futures::{SinkExt as _, StreamExt as _};
use nexd_rpc::wire::{Decoder, Encoder, Request, Response};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

#[derive(Parser)]
#[command(name = "nexdctl", author, version, about = "Control a running nexd agent", long_about = None)]
struct Cli {
    /// State directory the target agent was started with. Defaults to the same location `nexd`
    /// itself defaults to.
    #[arg(long, env = "NEXD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Current reconciler state, plus any authentication prompt.
    Status,
    /// Build version of the running agent.
    Version,
    /// This node's overlay IPv4 address.
    TunnelIpv4,
    /// This node's overlay IPv6 address.
    TunnelIpv6,
    /// Every peer device known to the agent, as JSON.
    ListPeers,
    /// ICMP reachability over overlay IPv4 addresses, as JSON.
    ConnectivityV4,
    /// ICMP reachability over overlay IPv6 addresses, as JSON.
    ConnectivityV6,
    /// Every active proxy rule, one canonical string per line.
    ProxyList,
    /// Adds an ingress rule: `<protocol>:<listen_port>:<destination_ip>:<destination_port>`.
    ProxyAddIngress { rule: String },
    /// Adds an egress rule: `<protocol>:<listen_port>:<destination_ip>:<destination_port>`.
    ProxyAddEgress { rule: String },
    /// Removes a previously added ingress rule.
    ProxyRemoveIngress { rule: String },
    /// Removes a previously added egress rule.
    ProxyRemoveEgress { rule: String },
    /// Turns on debug logging in the running agent.
    DebugOn,
    /// Turns off debug logging in the running agent.
    DebugOff,
    /// Reports whether debug logging is currently on.
    DebugStatus,
}

impl Command {
    fn into_request(self) -> Request {
        let (method, arg) = match self {
            Command::Status => ("Status", None),
            Command::Version => ("Version", None),
            Command::TunnelIpv4 => ("GetTunnelIPv4", None),
            Command::TunnelIpv6 => ("GetTunnelIPv6", None),
            Command::ListPeers => ("ListPeers", None),
            Command::ConnectivityV4 => ("ConnectivityV4", None),
            Command::ConnectivityV6 => ("ConnectivityV6", None),
            Command::ProxyList => ("ProxyList", None),
            Command::ProxyAddIngress { rule } => ("ProxyAddIngress", Some(rule)),
            Command::ProxyAddEgress { rule } => ("ProxyAddEgress", Some(rule)),
            Command::ProxyRemoveIngress { rule } => ("ProxyRemoveIngress", Some(rule)),
            Command::ProxyRemoveEgress { rule } => ("ProxyRemoveEgress", Some(rule)),
            Command::DebugOn => ("SetDebugOn", None),
            Command::DebugOff => ("SetDebugOff", None),
            Command::DebugStatus => ("GetDebug", None),
        };
        Request {
            method: method.to_string(),
            arg,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir.unwrap_or_else(default_state_dir);
    let socket_path = nexd_rpc::socket_path(&state_dir);

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("failed to connect to {} — is nexd running?", socket_path.display()))?;

    let (rd, wr) = stream.into_split();
    let mut reader = FramedRead::new(rd, Decoder::<Response>::default());
    let mut writer = FramedWrite::new(wr, Encoder::<Request>::default());

    writer
        .send(&cli.command.into_request())
        .await
        .context("failed to send request to nexd")?;

    let response = reader
        .next()
        .await
        .context("nexd closed the connection without replying")?
        .context("malformed response from nexd")?;

    if response.ok {
        if let Some(result) = response.result {
            println!("{result}");
        }
        Ok(())
    } else {
        bail!(response.error.unwrap_or_else(|| "nexd returned an error".to_string()))
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(std::env::temp_dir).join("nexd")
}
