//! Endpoint discovery (component B): determines the locally-usable public address either from
//! an explicit flag or, optionally, by sending a STUN binding request to a public STUN server
//! and reading back the reflexive transport address.
//!
//! STUN encode/decode is grounded on the teacher's `connlib/snownet::allocation` module, which
//! speaks the same `stun_codec`/`bytecodec` binding-request shape against relays instead of a
//! public STUN server.

use std::net::SocketAddr;
use std::time::Duration;

use bytecodec::{DecodeExt as _, EncodeExt as _};
use rand::random;
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5389::methods::BINDING;
use stun_codec::{Message, MessageClass, MessageDecoder, MessageEncoder, TransactionId};
use tokio::net::UdpSocket;

stun_codec::define_attribute_enums!(
    Attribute,
    AttributeDecoder,
    AttributeEncoder,
    [XorMappedAddress]
);

const STUN_TIMEOUT: Duration = Duration::from_secs(3);

/// A locally-usable endpoint: the explicit declaration if given, otherwise whatever STUN
/// discovered, plus a best-effort symmetric-NAT flag (different servers seeing different
/// reflexive ports implies symmetric NAT).
#[derive(Debug, Clone, Default)]
pub struct DiscoveredEndpoint {
    pub declared: Option<SocketAddr>,
    pub reflexive: Option<SocketAddr>,
    pub symmetric_nat: bool,
}

impl DiscoveredEndpoint {
    /// What the reconciler advertises to the controller: explicit declaration wins.
    pub fn best(&self) -> Option<SocketAddr> {
        self.declared.or(self.reflexive)
    }
}

/// Runs endpoint discovery. If `declared` is set, STUN is skipped entirely (spec §4.B: "If
/// `--local-endpoint-ip` is given, use it verbatim"). If `stun` is false, no reflexive address is
/// produced and the reconciler falls back to `local_endpoint`.
pub async fn discover(
    declared: Option<SocketAddr>,
    stun: bool,
    stun_servers: &[SocketAddr],
) -> DiscoveredEndpoint {
    if declared.is_some() || !stun {
        return DiscoveredEndpoint {
            declared,
            ..Default::default()
        };
    }

    let mut observed = Vec::new();
    for server in stun_servers.iter().take(2) {
        if let Ok(addr) = binding_request(*server).await {
            observed.push(addr);
        }
    }

    let reflexive = observed.first().copied();
    let symmetric_nat = observed.len() >= 2 && observed[0] != observed[1];

    DiscoveredEndpoint {
        declared: None,
        reflexive,
        symmetric_nat,
    }
}

async fn binding_request(server: SocketAddr) -> anyhow::Result<SocketAddr> {
    let bind_addr: SocketAddr = match server {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    let request = Message::<Attribute>::new(MessageClass::Request, BINDING, TransactionId::new(random()));
    let encoded = MessageEncoder::default()
        .encode_into_bytes(request)
        .map_err(|e| anyhow::anyhow!("failed to encode STUN request: {e}"))?;

    socket.send(&encoded).await?;

    let mut buf = [0u8; 512];
    let n = tokio::time::timeout(STUN_TIMEOUT, socket.recv(&mut buf)).await??;

    let decoded = MessageDecoder::<Attribute>::default()
        .decode_from_bytes(&buf[..n])
        .map_err(|e| anyhow::anyhow!("failed to decode STUN response: {e}"))?
        .map_err(|e| anyhow::anyhow!("malformed STUN response: {e}"))?;

    if decoded.class() != MessageClass::SuccessResponse {
        anyhow::bail!("STUN server returned {:?}", decoded.class());
    }

    let attr = decoded
        .get_attribute::<XorMappedAddress>()
        .ok_or_else(|| anyhow::anyhow!("STUN response missing XOR-MAPPED-ADDRESS"))?;

    Ok(attr.address())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn declared_endpoint_skips_stun() {
        let declared = "203.0.113.5:51820".parse().unwrap();
        let result = discover(Some(declared), true, &[]).await;

        assert_eq!(result.best(), Some(declared));
        assert!(result.reflexive.is_none());
    }

    #[tokio::test]
    async fn stun_disabled_produces_no_reflexive() {
        let result = discover(None, false, &["198.51.100.1:3478".parse().unwrap()]).await;

        assert!(result.best().is_none());
        assert!(!result.symmetric_nat);
    }
}
