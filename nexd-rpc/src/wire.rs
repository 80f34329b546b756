//! Length-prefixed JSON request/response framing over the control socket.
//!
//! Grounded on the teacher's `headless-client::ipc_service::ipc` generic `Decoder`/`Encoder`
//! pair (`LengthDelimitedCodec` plus a `serde_json` payload): same shape, generalised here to a
//! single request/response pair instead of the teacher's per-direction message enums, since the
//! control surface is a plain call/response RPC rather than a long-lived duplex session.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::LengthDelimitedCodec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub arg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            ok: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

pub struct Decoder<D> {
    inner: LengthDelimitedCodec,
    _marker: std::marker::PhantomData<D>,
}

impl<D> Default for Decoder<D> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<D: serde::de::DeserializeOwned> tokio_util::codec::Decoder for Decoder<D> {
    type Item = D;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<D>, Self::Error> {
        let Some(frame) = self.inner.decode(buf)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

pub struct Encoder<E> {
    inner: LengthDelimitedCodec,
    _marker: std::marker::PhantomData<E>,
}

impl<E> Default for Encoder<E> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E: Serialize> tokio_util::codec::Encoder<&E> for Encoder<E> {
    type Error = anyhow::Error;

    fn encode(&mut self, msg: &E, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(msg)?;
        self.inner.encode(json.into(), buf)?;
        Ok(())
    }
}
