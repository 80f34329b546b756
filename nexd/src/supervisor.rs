//! Lifecycle/supervisor (component J, SPEC_FULL §4.J): owns the startup and shutdown ordering
//! for every subsystem, under one `CancellationToken` and one `JoinSet`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use nexd_core::controller::{ControllerClient, RegisterDeviceRequest};
use nexd_core::device_cache::DeviceCache;
use nexd_core::model::CidrSet;
use nexd_core::reconciler::{Policy, Reconciler, ReconcilerConfig};
use nexd_core::{endpoint, keystore};
use nexd_dataplane::kernel::KernelDataPlane;
use nexd_dataplane::userspace::UserspaceDataPlane;
use nexd_dataplane::{DataPlane, Mode};
use nexd_logging::LevelControl;
use nexd_proxy::{Direction, ProxyManager};
use nexd_rpc::context::RpcContext;
use nexd_rpc::server::{self, RpcServer};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun1.l.google.com:19302"];

pub async fn run(cli: Cli, level: LevelControl) -> Result<()> {
    cli.validate()?;

    let proxy_mode = matches!(cli.command, Some(Command::Proxy { .. }));
    let state_dir = cli.state_dir();
    let socket_path = server::socket_path(&state_dir);

    if server::probe_existing(&socket_path).await {
        bail!("existing nexd service already running");
    }

    let keypair = match &cli.private_key {
        Some(encoded) => keystore::from_base64(encoded)?,
        None => keystore::load_or_create(&state_dir)?,
    };
    if let Some(expected) = &cli.public_key {
        let expected = nexd_dataplane::decode_public_key(expected).context("--public-key is not valid")?;
        if expected != *keypair.public_key.as_bytes() {
            bail!("--public-key does not match the derived public key");
        }
    }
    let local_public_key = *keypair.public_key.as_bytes();

    let stun_servers = resolve_stun_servers().await;
    let discovered = endpoint::discover(cli.local_endpoint_ip, cli.stun, &stun_servers).await;

    let controller = Arc::new(ControllerClient::new(cli.controller_url.clone(), cli.insecure_skip_tls_verify)?);
    if !cli.username.is_empty() {
        controller
            .login(&cli.username, &cli.password)
            .await
            .context("controller rejected credentials")?;
    }

    let hostname = local_hostname();
    let local_public_key_b64 = nexd_dataplane::encode_public_key(&local_public_key);
    let request_ip_str = cli.request_ip.map(|ip| ip.to_string());
    let local_endpoint_str = discovered.best().map(|addr| addr.to_string());
    let child_prefix_strs: Vec<String> = cli.child_prefix.iter().map(ToString::to_string).collect();

    let register_request = RegisterDeviceRequest {
        public_key: &local_public_key_b64,
        hostname: &hostname,
        request_ip: request_ip_str.as_deref(),
        local_endpoint: local_endpoint_str.as_deref(),
        child_prefixes: &child_prefix_strs,
        relay_node: cli.relay_node,
        discovery_node: cli.discovery_node,
    };
    let (_, self_record) = controller
        .register_device(&register_request)
        .await
        .context("failed to register device with controller")?;

    let organization_cidrs = match controller.get_organization().await {
        Ok(org) => org.cidrs,
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch organization CIDRs, continuing with an empty set");
            CidrSet::default()
        }
    };

    let cache = Arc::new(DeviceCache::new());
    cache.load_snapshot(&state_dir).await;

    let mode = Mode::select(proxy_mode);
    let (data_plane, userspace_handle): (Arc<dyn DataPlane>, Option<Arc<UserspaceDataPlane>>) = match mode {
        Mode::Kernel => {
            #[cfg(target_os = "linux")]
            nexd_dataplane::kernel::create_interface(
                nexd_dataplane::kernel::IFACE_NAME,
                self_record.overlay_ipv4,
                self_record.overlay_ipv6,
            )
                .await
                .context("failed to create kernel tunnel interface")?;
            (Arc::new(KernelDataPlane::new()), None)
        }
        Mode::Userspace => {
            let handle = Arc::new(UserspaceDataPlane::new());
            (handle.clone() as Arc<dyn DataPlane>, Some(handle))
        }
    };
    data_plane
        .init(&keypair.private_key, cli.listen_port, self_record.overlay_ipv4, self_record.overlay_ipv6)
        .context("failed to initialise tunnel data plane")?;

    let proxy = match (&cli.command, &userspace_handle) {
        (Some(Command::Proxy { ingress, egress }), Some(handle)) => {
            let net_stack = handle.net_stack().expect("userspace back-end initialised above");
            let manager = Arc::new(ProxyManager::new(net_stack, state_dir.clone()));
            manager.replay_persisted().await.context("failed to replay persisted proxy rules")?;

            for raw in ingress {
                manager.add(Direction::Ingress, raw, true).await.with_context(|| format!("invalid ingress rule `{raw}`"))?;
            }
            for raw in egress {
                manager.add(Direction::Egress, raw, true).await.with_context(|| format!("invalid egress rule `{raw}`"))?;
            }

            Some(manager)
        }
        _ => None,
    };

    let auth_detail: Arc<std::sync::RwLock<Option<String>>> = Arc::new(std::sync::RwLock::new(None));
    let policy = Policy {
        relay_only: cli.relay_only,
        persistent_keepalive: Some(Duration::from_secs(25)),
    };
    let reconciler_config = ReconcilerConfig {
        local_public_key,
        local_endpoint: discovered.best(),
        organization_cidrs,
        host_owned_routes: CidrSet::default(),
        policy,
        interval: RECONCILE_INTERVAL,
        username: cli.username.clone(),
        password: cli.password.clone(),
    };
    let (reconciler, reconciler_state) =
        Reconciler::new(controller, cache.clone(), data_plane.clone(), reconciler_config, auth_detail.clone());

    let rpc_proxy = proxy
        .clone()
        .unwrap_or_else(|| Arc::new(ProxyManager::new(nexd_dataplane::userspace::netstack::NetStack::new(vec![]), state_dir.clone())));
    let rpc_context = Arc::new(RpcContext {
        cache: cache.clone(),
        data_plane: data_plane.clone(),
        proxy: rpc_proxy,
        reconciler_state,
        auth_detail,
        level,
        local_public_key,
        local_is_relay: cli.relay_node,
        tunnel_ipv4: self_record.overlay_ipv4,
        tunnel_ipv6: self_record.overlay_ipv6,
        version: env!("CARGO_PKG_VERSION"),
    });
    let rpc_server = RpcServer::bind(&socket_path, rpc_context).await.context("failed to start control RPC server")?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let rpc_cancel = cancel.clone();
    tasks.spawn(async move { rpc_server.run(rpc_cancel).await });

    let reconciler_cancel = cancel.clone();
    tasks.spawn(async move { reconciler.run(reconciler_cancel).await });

    wait_for_shutdown_signal().await;
    cancel.cancel();

    while tasks.join_next().await.is_some() {}

    if let Some(proxy) = proxy {
        proxy.shutdown().await;
    }
    if let Err(e) = cache.persist_snapshot(&state_dir).await {
        tracing::warn!(error = %e, "failed to persist device cache snapshot on shutdown");
    }
    let _ = data_plane.close();

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn resolve_stun_servers() -> Vec<SocketAddr> {
    let mut servers = Vec::new();
    for name in STUN_SERVERS {
        if let Ok(addrs) = tokio::net::lookup_host(name).await {
            servers.extend(addrs);
        }
    }
    servers
}

#[cfg(target_os = "linux")]
fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

#[cfg(not(target_os = "linux"))]
fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
