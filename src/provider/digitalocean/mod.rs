//! DigitalOcean adapter over the v2 HTTP API.
//!
//! Regions stand in for hypervisors, each exposing its default VPC as the
//! primary network. Suspension maps to power actions.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ortho_config::OrthoConfig;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::http::{send_empty, send_json};
use super::{
    Hypervisor, NetworkProfile, ProviderAdapter, ProviderError, ProviderFuture, ServerHandle,
    ServerRequest, ServerSnapshot, ServerStatus,
};
use crate::config::{ConfigError, FieldMetadata};

/// Registry key of the DigitalOcean adapter.
pub const DIGITALOCEAN_PROVIDER: &str = "digitalocean";

/// Network id reported for a region's default VPC.
pub const DEFAULT_VPC: &str = "default";

/// DigitalOcean credentials loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "DIGITALOCEAN",
    discovery(
        app_name = "provisio",
        env_var = "PROVISIO_CONFIG_PATH",
        config_file_name = "provisio.toml",
        dotfile_name = ".provisio.toml",
        project_file_name = "provisio.toml"
    )
)]
pub struct DigitalOceanConfig {
    /// Personal access token.
    pub token: String,
    /// API base URL.
    #[ortho_config(default = "https://api.digitalocean.com/v2".to_owned())]
    pub api_base: String,
}

impl DigitalOceanConfig {
    /// Loads configuration from files and environment without parsing CLI
    /// arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("provisio")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that the token is present and the base URL parses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the variable to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new(
            "DigitalOcean API token",
            "DIGITALOCEAN_TOKEN",
            "token",
            "digitalocean",
        )
        .require(&self.token)?;
        FieldMetadata::new(
            "DigitalOcean API base URL",
            "DIGITALOCEAN_API_BASE",
            "api_base",
            "digitalocean",
        )
        .require_url(&self.api_base)
    }
}

#[derive(Deserialize)]
struct WireRegion {
    slug: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    available: bool,
}

#[derive(Deserialize)]
struct RegionsEnvelope {
    regions: Vec<WireRegion>,
}

#[derive(Serialize)]
struct CreateDropletBody<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc_uuid: Option<&'a str>,
}

#[derive(Serialize)]
struct ActionBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize)]
struct WireV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Default, Deserialize)]
struct WireNetworks {
    #[serde(default)]
    v4: Vec<WireV4>,
}

#[derive(Deserialize)]
struct WireDroplet {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    networks: WireNetworks,
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: WireDroplet,
}

impl WireDroplet {
    fn status(&self) -> ServerStatus {
        match self.status.as_str() {
            "active" => ServerStatus::Running,
            "off" => ServerStatus::Suspended,
            "archive" => ServerStatus::Terminated,
            _ => ServerStatus::Provisioning,
        }
    }

    fn public_ip(&self) -> Option<IpAddr> {
        self.networks
            .v4
            .iter()
            .filter(|network| network.kind == "public")
            .find_map(|network| network.ip_address.parse().ok())
    }
}

/// Droplet `ssh_keys` only accepts keys already uploaded to the account, so
/// raw public keys are installed through cloud-config user data instead.
fn authorized_keys_user_data(keys: &[String]) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let mut document = String::from("#cloud-config\nssh_authorized_keys:\n");
    for key in keys {
        document.push_str("  - ");
        document.push_str(key);
        document.push('\n');
    }
    Some(document)
}

/// Adapter for DigitalOcean droplets.
#[derive(Clone, Debug)]
pub struct DigitalOceanProvider {
    config: DigitalOceanConfig,
    client: Client,
}

impl DigitalOceanProvider {
    /// Creates the adapter after validating its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] naming the missing variable.
    pub fn new(config: DigitalOceanConfig, client: Client) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|err| ProviderError::Config(err.to_string()))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base.trim_end_matches('/'))
    }

    fn authorised(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.config.token.trim())
    }

    async fn fetch_regions(&self) -> Result<Vec<Hypervisor>, ProviderError> {
        let envelope: RegionsEnvelope = send_json(
            DIGITALOCEAN_PROVIDER,
            self.authorised(self.client.get(self.url("/regions"))),
            None,
        )
        .await?;
        Ok(envelope
            .regions
            .into_iter()
            .filter(|region| region.available)
            .map(|region| Hypervisor {
                id: region.slug.clone(),
                name: region.name,
                region: region.slug,
                default: false,
                networks: vec![NetworkProfile {
                    id: DEFAULT_VPC.to_owned(),
                    name: "default VPC".to_owned(),
                    primary: true,
                }],
            })
            .collect())
    }

    async fn create(&self, request: &ServerRequest) -> Result<ServerHandle, ProviderError> {
        request.validate()?;
        let region = request.hypervisor.as_deref().unwrap_or(&request.region);
        let vpc_uuid = request
            .network_profile
            .as_deref()
            .filter(|profile| *profile != DEFAULT_VPC);
        let body = CreateDropletBody {
            name: &request.name,
            region,
            size: &request.size,
            image: &request.image,
            tags: &request.tags,
            user_data: authorized_keys_user_data(&request.ssh_keys),
            vpc_uuid,
        };
        let envelope: DropletEnvelope = send_json(
            DIGITALOCEAN_PROVIDER,
            self.authorised(self.client.post(self.url("/droplets")))
                .json(&body),
            None,
        )
        .await?;
        Ok(ServerHandle {
            provider_instance_id: envelope.droplet.id.to_string(),
            status: envelope.droplet.status(),
        })
    }

    async fn fetch(&self, provider_instance_id: &str) -> Result<ServerSnapshot, ProviderError> {
        let envelope: DropletEnvelope = send_json(
            DIGITALOCEAN_PROVIDER,
            self.authorised(
                self.client.get(self.url(&format!("/droplets/{provider_instance_id}"))),
            ),
            Some(provider_instance_id),
        )
        .await?;
        let droplet = envelope.droplet;
        Ok(ServerSnapshot {
            provider_instance_id: droplet.id.to_string(),
            status: droplet.status(),
            public_ip: droplet.public_ip(),
            metadata: BTreeMap::from([
                ("name".to_owned(), droplet.name.clone()),
                ("status".to_owned(), droplet.status.clone()),
            ]),
        })
    }

    async fn power_action(
        &self,
        provider_instance_id: &str,
        kind: &str,
    ) -> Result<(), ProviderError> {
        send_empty(
            DIGITALOCEAN_PROVIDER,
            self.authorised(
                self.client.post(self.url(&format!("/droplets/{provider_instance_id}/actions"))),
            )
            .json(&ActionBody { kind }),
            Some(provider_instance_id),
        )
        .await
    }
}

impl ProviderAdapter for DigitalOceanProvider {
    fn name(&self) -> &str {
        DIGITALOCEAN_PROVIDER
    }

    fn connect(&self) -> ProviderFuture<'_, ()> {
        Box::pin(send_empty(
            DIGITALOCEAN_PROVIDER,
            self.authorised(self.client.get(self.url("/account"))),
            None,
        ))
    }

    fn list_hypervisors(&self) -> ProviderFuture<'_, Vec<Hypervisor>> {
        Box::pin(self.fetch_regions())
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
        Box::pin(send_empty(
            DIGITALOCEAN_PROVIDER,
            self.authorised(
                self.client.delete(self.url(&format!("/droplets/{provider_instance_id}"))),
            ),
            Some(provider_instance_id),
        ))
    }

    fn suspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.power_action(provider_instance_id, "power_off"))
    }

    fn unsuspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(self.power_action(provider_instance_id, "power_on"))
    }
}
