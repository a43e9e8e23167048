//! VirtFusion adapter over the panel's v1 HTTP API.
//!
//! A server is created against a package on a hypervisor and then built
//! with an OS template. Sizes and images are package and template ids; when
//! they are not numeric the configured defaults apply.

use std::collections::BTreeMap;
use std::net::IpAddr;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::http::{send_empty, send_json};
use super::{
    Hypervisor, NetworkProfile, ProviderAdapter, ProviderError, ProviderFuture, ServerHandle,
    ServerRequest, ServerSnapshot, ServerStatus, select_placement,
};

mod config;

pub use config::VirtFusionConfig;

/// Registry key of the VirtFusion adapter.
pub const VIRTFUSION_PROVIDER: &str = "virtfusion";

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct WireNetwork {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    primary: bool,
}

#[derive(Deserialize)]
struct WireHypervisor {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    networks: Vec<WireNetwork>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateServerBody {
    package_id: u64,
    user_id: u64,
    hypervisor_id: u64,
    ipv4: u32,
    network_profile: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu_cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildServerBody<'a> {
    operating_system_id: u64,
    name: &'a str,
    hostname: &'a str,
    ssh_keys: &'a [String],
}

#[derive(Deserialize)]
struct WireAddress {
    address: String,
}

#[derive(Default, Deserialize)]
struct WireInterface {
    #[serde(default)]
    ipv4: Vec<WireAddress>,
}

#[derive(Default, Deserialize)]
struct WireNetworkState {
    #[serde(default)]
    interfaces: Vec<WireInterface>,
}

#[derive(Deserialize)]
struct WireServer {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    suspended: bool,
    #[serde(default)]
    network: WireNetworkState,
}

impl WireServer {
    fn status(&self) -> ServerStatus {
        if self.suspended {
            return ServerStatus::Suspended;
        }
        match self.state.as_str() {
            "running" | "online" => ServerStatus::Running,
            "complete" | "stopped" | "offline" => ServerStatus::Created,
            "deleted" | "destroyed" => ServerStatus::Terminated,
            _ => ServerStatus::Provisioning,
        }
    }

    fn public_ip(&self) -> Option<IpAddr> {
        self.network
            .interfaces
            .iter()
            .flat_map(|interface| interface.ipv4.iter())
            .find_map(|entry| entry.address.parse().ok())
    }
}

/// Error for a server whose build request failed after it was created.
///
/// Always [`ProviderError::Permanent`]: a retry would create a second server.
fn failed_build(
    server_id: &str,
    build: &ProviderError,
    cleanup: Result<(), ProviderError>,
) -> ProviderError {
    match cleanup {
        Err(err) if !err.is_not_found() => ProviderError::Permanent(format!(
            "build of server {server_id} failed: {build}; removing it also failed and it must be \
             deleted by hand: {err}"
        )),
        _ => ProviderError::Permanent(format!(
            "build of server {server_id} failed and the server was removed: {build}"
        )),
    }
}

/// Adapter for a VirtFusion panel.
#[derive(Clone, Debug)]
pub struct VirtFusionProvider {
    config: VirtFusionConfig,
    api_base: String,
    client: Client,
}

impl VirtFusionProvider {
    /// Creates the adapter after validating its configuration. Requests go
    /// through `client`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] naming the missing variable.
    pub fn new(config: VirtFusionConfig, client: Client) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::Config(err.to_string()))?;
        let api_base = config.api_base();
        Ok(Self {
            config,
            api_base,
            client,
        })
    }

    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(self.config.api_token.trim())
            .header("Accept", "application/json")
    }

    fn numeric_or_default(
        field: &str,
        value: &str,
        fallback: Option<u64>,
    ) -> Result<u64, ProviderError> {
        value.parse().ok().or(fallback).ok_or_else(|| {
            ProviderError::Validation(format!(
                "{field} '{value}' is not a VirtFusion id and no default is configured"
            ))
        })
    }

    fn parse_id(field: &str, value: &str) -> Result<u64, ProviderError> {
        value.parse().map_err(|_| {
            ProviderError::Validation(format!("{field} '{value}' is not a VirtFusion id"))
        })
    }

    async fn fetch_hypervisors(&self) -> Result<Vec<Hypervisor>, ProviderError> {
        let url = format!("{}/compute/hypervisors", self.api_base);
        let envelope: Envelope<Vec<WireHypervisor>> = send_json(
            VIRTFUSION_PROVIDER,
            self.authorised(self.client.get(&url)),
            None,
        )
        .await?;
        Ok(envelope
            .data
            .into_iter()
            .filter(|hypervisor| hypervisor.enabled.unwrap_or(true))
            .map(|hypervisor| Hypervisor {
                id: hypervisor.id.to_string(),
                name: hypervisor.name,
                region: hypervisor.group.unwrap_or_default(),
                default: false,
                networks: hypervisor
                    .networks
                    .into_iter()
                    .map(|network| NetworkProfile {
                        id: network.id.to_string(),
                        name: network.name,
                        primary: network.primary,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn create(&self, request: &ServerRequest) -> Result<ServerHandle, ProviderError> {
        request.validate()?;
        let package_id =
            Self::numeric_or_default("size", &request.size, self.config.default_package_id)?;
        let template_id = Self::numeric_or_default(
            "image",
            &request.image,
            self.config.default_os_template_id,
        )?;

        let hypervisors = self.fetch_hypervisors().await?;
        let placement = select_placement(
            request,
            &hypervisors,
            self.config.default_hypervisor_id.as_deref(),
        )?;

        let body = CreateServerBody {
            package_id,
            user_id: self.config.user_id,
            hypervisor_id: Self::parse_id("hypervisor", &placement.hypervisor_id)?,
            ipv4: 1,
            network_profile: Self::parse_id("network profile", &placement.network_profile_id)?,
            cpu_cores: request.resources.map(|resources| resources.cpu),
            memory: request.resources.map(|resources| resources.memory_mb),
            storage: request.resources.map(|resources| resources.disk_gb),
        };
        let url = format!("{}/servers", self.api_base);
        let created: Envelope<WireServer> = send_json(
            VIRTFUSION_PROVIDER,
            self.authorised(self.client.post(&url)).json(&body),
            None,
        )
        .await?;
        let server_id = created.data.id.to_string();
        debug!(provider = VIRTFUSION_PROVIDER, server_id, "server created; building");

        let build = BuildServerBody {
            operating_system_id: template_id,
            name: &request.name,
            hostname: &request.name,
            ssh_keys: &request.ssh_keys,
        };
        let build_url = format!("{}/servers/{server_id}/build", self.api_base);
        if let Err(build_err) = send_empty(
            VIRTFUSION_PROVIDER,
            self.authorised(self.client.post(&build_url)).json(&build),
            Some(&server_id),
        )
        .await
        {
            warn!(
                provider = VIRTFUSION_PROVIDER,
                server_id,
                error = %build_err,
                "build failed; removing server"
            );
            let cleanup = self.remove(&server_id).await;
            return Err(failed_build(&server_id, &build_err, cleanup));
        }

        Ok(ServerHandle {
            provider_instance_id: server_id,
            status: ServerStatus::Provisioning,
        })
    }

    async fn fetch(&self, provider_instance_id: &str) -> Result<ServerSnapshot, ProviderError> {
        let url = format!("{}/servers/{provider_instance_id}", self.api_base);
        let envelope: Envelope<WireServer> = send_json(
            VIRTFUSION_PROVIDER,
            self.authorised(self.client.get(&url)),
            Some(provider_instance_id),
        )
        .await?;
        let server = envelope.data;
        Ok(ServerSnapshot {
            provider_instance_id: server.id.to_string(),
            status: server.status(),
            public_ip: server.public_ip(),
            metadata: BTreeMap::from([
                ("name".to_owned(), server.name.clone()),
                ("state".to_owned(), server.state.clone()),
            ]),
        })
    }

    async fn remove(&self, provider_instance_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/servers/{provider_instance_id}?delay=0",
            self.api_base
        );
        send_empty(
            VIRTFUSION_PROVIDER,
            self.authorised(self.client.delete(&url)),
            Some(provider_instance_id),
        )
        .await
    }

    async fn server_action(
        &self,
        provider_instance_id: &str,
        action: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/servers/{provider_instance_id}/{action}", self.api_base);
        send_empty(
            VIRTFUSION_PROVIDER,
            self.authorised(self.client.post(&url)),
            Some(provider_instance_id),
        )
        .await
    }
}

impl ProviderAdapter for VirtFusionProvider {
    fn name(&self) -> &str {
        VIRTFUSION_PROVIDER
    }

    fn connect(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let url = format!("{}/connect", self.api_base);
            send_empty(
                VIRTFUSION_PROVIDER,
                self.authorised(self.client.get(&url)),
                None,
            )
            .await
        })
    }

    fn list_hypervisors(&self) -> ProviderFuture<'_, Vec<Hypervisor>> {
        Box::pin(self.fetch_hypervisors())
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> ProviderFuture<'a, ServerHandle> {
        Box::pin(self.create(request))
    }

    fn get_server<'a>(
        &'a self,
        provider_instance_id: &'a str,
    ) -> ProviderFuture<'a, ServerSnapshot> {
        Box::pin(self.fetch(provider_instance_id))
    }

    fn delete_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.remove(provider_instance_id))
    }

    fn suspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.server_action(provider_instance_id, "suspend"))
    }

    fn unsuspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.server_action(provider_instance_id, "unsuspend"))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::retry::Retryable;

    fn config(token: &str, host: &str) -> VirtFusionConfig {
        VirtFusionConfig {
            api_token: token.to_owned(),
            host: host.to_owned(),
            default_package_id: Some(3),
            default_hypervisor_id: None,
            default_os_template_id: None,
            user_id: 1,
        }
    }

    #[rstest]
    #[case("", "https://panel.example.com", "VIRTFUSION_API_TOKEN")]
    #[case("token", "", "VIRTFUSION_HOST")]
    fn construction_requires_credentials(
        #[case] token: &str,
        #[case] host: &str,
        #[case] env_var: &str,
    ) {
        let Err(err) = VirtFusionProvider::new(config(token, host), Client::new()) else {
            panic!("construction should fail");
        };
        assert!(matches!(err, ProviderError::Config(_)));
        assert!(err.to_string().contains(env_var), "message: {err}");
    }

    #[test]
    fn api_base_strips_trailing_slash() {
        let provider = VirtFusionProvider::new(
            config("token", "https://panel.example.com/"),
            Client::new(),
        )
        .unwrap_or_else(|err| panic!("construct: {err}"));
        assert_eq!(provider.api_base, "https://panel.example.com/api/v1");
    }

    #[test]
    fn size_falls_back_to_default_package() {
        assert_eq!(
            VirtFusionProvider::numeric_or_default("size", "small", Some(3)),
            Ok(3)
        );
        assert_eq!(
            VirtFusionProvider::numeric_or_default("size", "12", Some(3)),
            Ok(12)
        );
        assert!(VirtFusionProvider::numeric_or_default("image", "debian", None).is_err());
    }

    #[rstest]
    #[case(json!({"id": 9, "state": "running", "network": {"interfaces": [{"ipv4": [{"address": "203.0.113.9"}]}]}}), ServerStatus::Running, true)]
    #[case(json!({"id": 9, "state": "building"}), ServerStatus::Provisioning, false)]
    #[case(json!({"id": 9, "state": "running", "suspended": true}), ServerStatus::Suspended, false)]
    fn wire_server_maps_state(
        #[case] body: serde_json::Value,
        #[case] expected: ServerStatus,
        #[case] has_ip: bool,
    ) {
        let server: WireServer =
            serde_json::from_value(body).unwrap_or_else(|err| panic!("decode: {err}"));
        assert_eq!(server.status(), expected);
        assert_eq!(server.public_ip().is_some(), has_ip);
    }

    #[rstest]
    #[case::removed(Ok(()), "was removed")]
    #[case::already_gone(Err(ProviderError::NotFound { id: "41".to_owned() }), "was removed")]
    #[case::left_behind(Err(ProviderError::Transient("503".to_owned())), "deleted by hand")]
    fn failed_builds_are_never_retried(
        #[case] cleanup: Result<(), ProviderError>,
        #[case] expected: &str,
    ) {
        let build = ProviderError::Transient("502 Bad Gateway".to_owned());

        let err = failed_build("41", &build, cleanup);

        assert!(matches!(err, ProviderError::Permanent(_)), "{err:?}");
        assert!(!err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("server 41"), "{message}");
        assert!(message.contains("502 Bad Gateway"), "{message}");
        assert!(message.contains(expected), "{message}");
    }
}
