//! VirtFusion connection settings loaded via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::{ConfigError, FieldMetadata};

/// VirtFusion panel credentials and placement defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VIRTFUSION",
    discovery(
        app_name = "provisio",
        env_var = "PROVISIO_CONFIG_PATH",
        config_file_name = "provisio.toml",
        dotfile_name = ".provisio.toml",
        project_file_name = "provisio.toml"
    )
)]
pub struct VirtFusionConfig {
    /// Bearer token issued by the panel.
    pub api_token: String,
    /// Panel base URL, for example `https://panel.example.com`.
    pub host: String,
    /// Package used when an instance size is not a package id.
    pub default_package_id: Option<u64>,
    /// Hypervisor used when a request names none.
    pub default_hypervisor_id: Option<String>,
    /// OS template used when an instance image is not a template id.
    pub default_os_template_id: Option<u64>,
    /// Panel user that owns created servers.
    #[ortho_config(default = 1)]
    pub user_id: u64,
}

impl VirtFusionConfig {
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

    /// Checks that the token and host are present and the host is a URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the variable to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new(
            "VirtFusion API token",
            "VIRTFUSION_API_TOKEN",
            "api_token",
            "virtfusion",
        )
        .require(&self.api_token)?;
        let host_field = FieldMetadata::new(
            "VirtFusion panel host",
            "VIRTFUSION_HOST",
            "host",
            "virtfusion",
        );
        host_field.require(&self.host)?;
        host_field.require_url(&self.host)
    }

    /// Base URL of the v1 API.
    #[must_use]
    pub fn api_base(&self) -> String {
        format!("{}/api/v1", self.host.trim().trim_end_matches('/'))
    }
}
