//! Control RPC surface (component I, spec §4.I): a length-prefixed JSON request/response
//! channel over a host-local Unix socket, used by `nexdctl` and any other local operator tool.

pub mod context;
pub mod error;
pub mod server;
pub mod wire;

pub use context::RpcContext;
pub use error::RpcError;
pub use server::{RpcServer, probe_existing, socket_path};
pub use wire::{Decoder, Encoder, Request, Response};
