//! Controller client (component C): typed `reqwest`-based RPCs against the controller HTTP API.
//!
//! Auth is a bearer token obtained via username/password login; 401/403 map to
//! [`ControllerError::Unauthorized`] so the reconciler can transition to `WaitingForAuth`.
//! Grounded on the teacher's `reqwest`/`rustls-tls` stack (`headless-client` talks to the portal
//! over the same backend, `--insecure-skip-tls-verify` maps onto `danger_accept_invalid_certs`
//! exactly as the teacher's own insecure-mode flags do).

use std::net::IpAddr;
use std::sync::RwLock;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ControllerError;
use crate::model::{CidrSet, DeviceRecord, canonicalise_ip, canonicalise_socket_addr};

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: Url,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterDeviceRequest<'a> {
    pub public_key: &'a str,
    pub hostname: &'a str,
    pub request_ip: Option<&'a str>,
    pub local_endpoint: Option<&'a str>,
    pub child_prefixes: &'a [String],
    pub relay_node: bool,
    pub discovery_node: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeviceDto {
    pub device_id: String,
    pub organization_id: String,
    pub public_key: String,
    pub hostname: String,
    pub overlay_ipv4: Option<String>,
    pub overlay_ipv6: Option<String>,
    pub local_endpoint: Option<String>,
    pub reflexive_ipv4: Option<String>,
    #[serde(default)]
    pub symmetric_nat: bool,
    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub child_prefixes: Vec<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrganizationDto {
    pub id: String,
    #[serde(default)]
    pub cidrs: Vec<String>,
}

pub struct Organization {
    pub id: String,
    pub cidrs: CidrSet,
}

impl DeviceDto {
    /// Parses into the internal data model, canonicalising addresses and collapsing CIDR lists
    /// into order-insensitive sets. Malformed fields drop just that field with a warning rather
    /// than rejecting the whole device (the controller, not us, owns correctness of its data).
    pub fn into_record(self) -> (nexd_dataplane::PublicKey, DeviceRecord) {
        let public_key = nexd_dataplane::decode_public_key(&self.public_key).unwrap_or_else(|_| {
            tracing::warn!(device_id = %self.device_id, "device has unparseable public key");
            [0u8; 32]
        });

        let parse_ip = |s: Option<String>, field: &str| -> Option<IpAddr> {
            s.and_then(|s| {
                s.parse()
                    .inspect_err(|_| tracing::warn!(device_id = %self.device_id, field, "unparseable address"))
                    .ok()
            })
            .map(canonicalise_ip)
        };
        let parse_sock = |s: Option<String>, field: &str| -> Option<std::net::SocketAddr> {
            s.and_then(|s| {
                s.parse()
                    .inspect_err(|_| tracing::warn!(device_id = %self.device_id, field, "unparseable endpoint"))
                    .ok()
            })
            .map(canonicalise_socket_addr)
        };
        let parse_cidrs = |list: Vec<String>, field: &'static str| -> CidrSet {
            let device_id = self.device_id.clone();
            CidrSet::new(list.into_iter().filter_map(move |s| {
                s.parse()
                    .inspect_err(|_| tracing::warn!(device_id = %device_id, field, cidr = %s, "unparseable CIDR"))
                    .ok()
            }))
        };

        let record = DeviceRecord {
            device_id: self.device_id.clone(),
            organization_id: self.organization_id.clone(),
            hostname: self.hostname.clone(),
            overlay_ipv4: parse_ip(self.overlay_ipv4.clone(), "overlay_ipv4"),
            overlay_ipv6: parse_ip(self.overlay_ipv6.clone(), "overlay_ipv6"),
            local_endpoint: parse_sock(self.local_endpoint.clone(), "local_endpoint"),
            reflexive_ipv4: parse_sock(self.reflexive_ipv4.clone(), "reflexive_ipv4"),
            symmetric_nat: self.symmetric_nat,
            relay: self.relay,
            child_prefixes: parse_cidrs(self.child_prefixes.clone(), "child_prefixes"),
            allowed_ips: parse_cidrs(self.allowed_ips.clone(), "allowed_ips"),
        };

        (public_key, record)
    }
}

impl ControllerClient {
    pub fn new(base_url: Url, insecure_skip_tls_verify: bool) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_skip_tls_verify)
            .build()
            .map_err(|e| ControllerError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            token: RwLock::new(None),
        })
    }

    pub fn set_token(&self, token: String) {
        *self.token.write().expect("lock poisoned") = Some(token);
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.read().expect("lock poisoned").as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Exchanges username/password for a bearer token, storing it for subsequent requests.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ControllerError> {
        let url = self.base_url.join("/api/v1/login").map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = map_status(response)?;

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ControllerError::Decode(e.to_string()))?;

        self.set_token(body.token);
        Ok(())
    }

    pub async fn register_device(
        &self,
        req: &RegisterDeviceRequest<'_>,
    ) -> Result<(nexd_dataplane::PublicKey, DeviceRecord), ControllerError> {
        let url = self.base_url.join("/api/v1/devices").map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = self
            .authed(self.http.post(url))
            .json(req)
            .send()
            .await
            .map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = map_status(response)?;
        let dto: DeviceDto = response.json().await.map_err(|e| ControllerError::Decode(e.to_string()))?;
        Ok(dto.into_record())
    }

    /// Full device list for the current organisation.
    pub async fn list_devices(&self) -> Result<Vec<(nexd_dataplane::PublicKey, DeviceRecord)>, ControllerError> {
        let url = self.base_url.join("/api/v1/devices").map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = map_status(response)?;
        let dtos: Vec<DeviceDto> = response.json().await.map_err(|e| ControllerError::Decode(e.to_string()))?;
        Ok(dtos.into_iter().map(DeviceDto::into_record).collect())
    }

    pub async fn get_organization(&self) -> Result<Organization, ControllerError> {
        let url = self.base_url.join("/api/v1/organization").map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = self
            .authed(self.http.get(url))
            .send()
            .await
            .map_err(|e| ControllerError::Transport(e.to_string()))?;

        let response = map_status(response)?;
        let dto: OrganizationDto = response.json().await.map_err(|e| ControllerError::Decode(e.to_string()))?;

        Ok(Organization {
            id: dto.id,
            cidrs: CidrSet::new(dto.cidrs.into_iter().filter_map(|s| s.parse().ok())),
        })
    }
}

fn map_status(response: reqwest::Response) -> Result<reqwest::Response, ControllerError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ControllerError::Unauthorized),
        status if status.is_server_error() => Err(ControllerError::Transport(format!("server error: {status}"))),
        status if status.is_success() => Ok(response),
        status => Err(ControllerError::Transport(format!("unexpected status: {status}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_dto_maps_unparseable_address_to_none() {
        let dto = DeviceDto {
            device_id: "d1".into(),
            organization_id: "o1".into(),
            public_key: base64_of([7u8; 32]),
            hostname: "host".into(),
            overlay_ipv4: Some("not-an-ip".into()),
            overlay_ipv6: None,
            local_endpoint: None,
            reflexive_ipv4: None,
            symmetric_nat: false,
            relay: false,
            child_prefixes: vec![],
            allowed_ips: vec![],
        };

        let (_, record) = dto.into_record();
        assert!(record.overlay_ipv4.is_none());
    }

    #[test]
    fn device_dto_collapses_duplicate_cidrs() {
        let dto = DeviceDto {
            device_id: "d1".into(),
            organization_id: "o1".into(),
            public_key: base64_of([7u8; 32]),
            hostname: "host".into(),
            overlay_ipv4: None,
            overlay_ipv6: None,
            local_endpoint: None,
            reflexive_ipv4: None,
            symmetric_nat: false,
            relay: false,
            child_prefixes: vec!["10.0.0.0/24".into(), "10.0.0.0/24".into()],
            allowed_ips: vec![],
        };

        let (_, record) = dto.into_record();
        assert_eq!(record.child_prefixes.iter().count(), 1);
    }

    fn base64_of(bytes: [u8; 32]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}
