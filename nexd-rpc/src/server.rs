//! Control RPC server (component I): a Unix domain stream listener at
//! `<state-dir>/nexd.sock`, serving length-prefixed JSON request/response frames (spec §4.I).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::context::RpcContext;
use crate::wire::{Decoder, Encoder, Request, Response};

pub const SOCKET_FILE: &str = "nexd.sock";

pub fn socket_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SOCKET_FILE)
}

pub struct RpcServer {
    listener: UnixListener,
    context: Arc<RpcContext>,
}

impl RpcServer {
    /// Binds the socket, removing any stale one left by a previous (now-dead) process. Startup
    /// ordering is the caller's responsibility: run [`probe_existing`] against the same path
    /// *before* calling this, since binding always succeeds once the stale file is gone.
    pub async fn bind(path: &Path, context: Arc<RpcContext>) -> Result<Self> {
        let _ = tokio::fs::remove_file(path).await;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind control socket at {}", path.display()))?;
        set_owner_only_permissions(path)
            .await
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;

        Ok(Self { listener, context })
    }

    /// Serves connections until `cancel` fires; every in-flight connection handler is awaited
    /// before this returns (spec §5: "no task may outlive the wait").
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let context = self.context.clone();
                            tasks.spawn(handle_connection(stream, context));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept control RPC connection");
                        }
                    }
                }
            }
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn handle_connection(stream: UnixStream, context: Arc<RpcContext>) {
    let (rd, wr) = stream.into_split();
    let mut reader = FramedRead::new(rd, Decoder::<Request>::default());
    let mut writer = FramedWrite::new(wr, Encoder::<Response>::default());

    loop {
        let request = match tokio_stream_next(&mut reader).await {
            Some(Ok(req)) => req,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "malformed control RPC frame");
                return;
            }
            None => return,
        };

        let response = match context.dispatch(&request.method, request.arg).await {
            Ok(result) => Response::ok(result),
            Err(e) => Response::err(e.to_string()),
        };

        use futures::SinkExt as _;
        if writer.send(&response).await.is_err() {
            return;
        }
    }
}

async fn tokio_stream_next<T>(reader: &mut FramedRead<tokio::net::unix::OwnedReadHalf, Decoder<T>>) -> Option<anyhow::Result<T>>
where
    T: serde::de::DeserializeOwned,
{
    use futures::StreamExt as _;
    reader.next().await
}

/// Startup probe (`CtlStatus`, spec §3 "at most one agent per host"): connects to `path` and
/// sends a `Status` request with a short timeout. A reply of any kind means another agent is
/// already bound there.
pub async fn probe_existing(path: &Path) -> bool {
    let connect = UnixStream::connect(path);
    let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(500), connect).await else {
        return false;
    };

    let (rd, wr) = stream.into_split();
    let mut reader = FramedRead::new(rd, Decoder::<Response>::default());
    let mut writer = FramedWrite::new(wr, Encoder::<Request>::default());

    use futures::SinkExt as _;
    if writer
        .send(&Request {
            method: "Status".to_string(),
            arg: None,
        })
        .await
        .is_err()
    {
        return false;
    }

    use futures::StreamExt as _;
    tokio::time::timeout(Duration::from_millis(500), reader.next())
        .await
        .is_ok_and(|r| r.is_some())
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
