//! Provider-neutral request and response shapes.

use std::collections::BTreeMap;
use std::net::IpAddr;

use super::ProviderError;
use crate::model::Resources;

/// Parameters required to create a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerRequest {
    /// Server name, used as hostname where the provider supports it.
    pub name: String,
    /// Provider size, flavour or package.
    pub size: String,
    /// Provider image or OS template.
    pub image: String,
    /// Target region.
    pub region: String,
    /// Explicit hypervisor placement.
    pub hypervisor: Option<String>,
    /// Explicit network profile.
    pub network_profile: Option<String>,
    /// Explicit sizing.
    pub resources: Option<Resources>,
    /// Public keys to install.
    pub ssh_keys: Vec<String>,
    /// Provider tags.
    pub tags: Vec<String>,
}

impl ServerRequest {
    /// Starts a builder for a [`ServerRequest`].
    #[must_use]
    pub fn builder() -> ServerRequestBuilder {
        ServerRequestBuilder::default()
    }

    /// Validates required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] naming the first empty field.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.name.is_empty() {
            return Err(ProviderError::Validation("name".to_owned()));
        }
        if self.size.is_empty() {
            return Err(ProviderError::Validation("size".to_owned()));
        }
        if self.image.is_empty() {
            return Err(ProviderError::Validation("image".to_owned()));
        }
        if self.region.is_empty() {
            return Err(ProviderError::Validation("region".to_owned()));
        }
        if self.ssh_keys.iter().any(String::is_empty) {
            return Err(ProviderError::Validation("ssh_keys".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`ServerRequest`] that trims and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerRequestBuilder {
    name: String,
    size: String,
    image: String,
    region: String,
    hypervisor: Option<String>,
    network_profile: Option<String>,
    resources: Option<Resources>,
    ssh_keys: Vec<String>,
    tags: Vec<String>,
}

impl ServerRequestBuilder {
    /// Sets the server name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the size.
    #[must_use]
    pub fn size(mut self, value: impl Into<String>) -> Self {
        self.size = value.into();
        self
    }

    /// Sets the image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the optional hypervisor.
    #[must_use]
    pub fn hypervisor(mut self, value: Option<String>) -> Self {
        self.hypervisor = value;
        self
    }

    /// Sets the optional network profile.
    #[must_use]
    pub fn network_profile(mut self, value: Option<String>) -> Self {
        self.network_profile = value;
        self
    }

    /// Sets explicit sizing.
    #[must_use]
    pub const fn resources(mut self, value: Option<Resources>) -> Self {
        self.resources = value;
        self
    }

    /// Adds a public key.
    #[must_use]
    pub fn ssh_key(mut self, value: impl Into<String>) -> Self {
        self.ssh_keys.push(value.into());
        self
    }

    /// Replaces the tag list.
    #[must_use]
    pub fn tags(mut self, value: Vec<String>) -> Self {
        self.tags = value;
        self
    }

    /// Builds and validates the [`ServerRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when a required field is empty.
    pub fn build(self) -> Result<ServerRequest, ProviderError> {
        let trim_optional = |value: Option<String>| {
            value
                .map(|raw| raw.trim().to_owned())
                .filter(|trimmed| !trimmed.is_empty())
        };
        let request = ServerRequest {
            name: self.name.trim().to_owned(),
            size: self.size.trim().to_owned(),
            image: self.image.trim().to_owned(),
            region: self.region.trim().to_owned(),
            hypervisor: trim_optional(self.hypervisor),
            network_profile: trim_optional(self.network_profile),
            resources: self.resources,
            ssh_keys: self
                .ssh_keys
                .into_iter()
                .map(|key| key.trim().to_owned())
                .collect(),
            tags: self.tags,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Coarse server state reported by a provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerStatus {
    /// Build in progress.
    Provisioning,
    /// Built but not yet booted.
    Created,
    /// Booted.
    Running,
    /// Suspended or powered off.
    Suspended,
    /// Destroyed.
    Terminated,
}

/// Returned by a successful create call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerHandle {
    /// Identifier assigned by the provider.
    pub provider_instance_id: String,
    /// State right after creation.
    pub status: ServerStatus,
}

/// Point-in-time view of a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSnapshot {
    /// Identifier assigned by the provider.
    pub provider_instance_id: String,
    /// Current state.
    pub status: ServerStatus,
    /// Public address, once allocated.
    pub public_ip: Option<IpAddr>,
    /// Provider specific extras.
    pub metadata: BTreeMap<String, String>,
}

impl ServerSnapshot {
    /// Running with a public address.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.status, ServerStatus::Running) && self.public_ip.is_some()
    }
}

/// Network that a hypervisor can attach servers to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkProfile {
    /// Provider identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Used when the request names no profile.
    pub primary: bool,
}

/// A placement target exposed by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Hypervisor {
    /// Provider identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Region the hypervisor lives in.
    pub region: String,
    /// Used when the request names no hypervisor.
    pub default: bool,
    /// Networks available on the hypervisor.
    pub networks: Vec<NetworkProfile>,
}
