//! Global subscriber setup plus a level handle the `SetDebug*` RPCs can flip at runtime.

use anyhow::{Context as _, Result};
use tracing_subscriber::{
    EnvFilter, Registry, filter::ParseError, fmt, layer::SubscriberExt as _, reload,
    util::SubscriberInitExt as _,
};

pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// A filter directive that silences crates whose logs are rarely useful at `debug`.
const IRRELEVANT_CRATES: &str = "rtnetlink=warn,netlink_proto=warn";

fn try_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Registers the global subscriber and returns a handle that can change the active filter.
///
/// Call once, as early as possible in `main`.
pub fn setup_global_subscriber(default_directives: &str) -> Result<ReloadHandle> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| default_directives.to_string());
    let filter = try_filter(&directives).context("failed to parse log directives")?;
    let (filter, handle) = reload::Layer::new(filter);

    let subscriber = Registry::default().with(filter).with(fmt::layer());
    subscriber
        .try_init()
        .context("failed to install global tracing subscriber")?;

    Ok(handle)
}

/// Level cell shared between the subscriber and the control RPC server.
///
/// Mirrors the device cache's single reader-writer discipline: readers (log sites) go
/// through `tracing`'s own dispatch, writers (the `SetDebug*` RPCs) go through `set`.
#[derive(Clone)]
pub struct LevelControl {
    handle: ReloadHandle,
}

impl LevelControl {
    pub fn new(handle: ReloadHandle) -> Self {
        Self { handle }
    }

    pub fn set_debug(&self, on: bool) -> Result<()> {
        let directives = if on { "debug" } else { "info" };
        let filter = try_filter(directives).expect("static directive always parses");
        self.handle
            .reload(filter)
            .context("failed to reload log filter")
    }

    /// Best-effort: returns `true` if the filter currently looks like a debug filter.
    pub fn is_debug(&self) -> bool {
        self.handle
            .with_current(|f| f.to_string().contains("debug"))
            .unwrap_or(false)
    }
}

/// A subscriber suitable for use in unit tests; does not touch global state permanently.
pub fn test_subscriber(directives: &str) -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}
