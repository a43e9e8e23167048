//! Hypervisor and network placement policy.
//!
//! An explicit choice in the request must exist. Otherwise the configured or
//! provider-flagged default hypervisor is used together with its primary
//! network. Anything left unresolved is a provisioning error naming what is
//! missing.

use super::{Hypervisor, ProviderError, ServerRequest};

/// Resolved placement for a create call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Placement {
    /// Chosen hypervisor id.
    pub hypervisor_id: String,
    /// Chosen network profile id.
    pub network_profile_id: String,
}

/// Resolves the hypervisor and network profile for `request`.
///
/// # Errors
///
/// Returns [`ProviderError::Provisioning`] naming the hypervisor or network
/// that could not be resolved.
pub fn select_placement(
    request: &ServerRequest,
    hypervisors: &[Hypervisor],
    configured_default: Option<&str>,
) -> Result<Placement, ProviderError> {
    let hypervisor = select_hypervisor(request, hypervisors, configured_default)?;
    let network = match request.network_profile.as_deref() {
        Some(wanted) => hypervisor
            .networks
            .iter()
            .find(|network| network.id == wanted || network.name == wanted)
            .ok_or_else(|| ProviderError::Provisioning {
                resource: "network".to_owned(),
                message: format!(
                    "network profile '{wanted}' is not available on hypervisor {}",
                    hypervisor.id
                ),
            })?,
        None => hypervisor
            .networks
            .iter()
            .find(|network| network.primary)
            .ok_or_else(|| ProviderError::Provisioning {
                resource: "network".to_owned(),
                message: format!(
                    "hypervisor {} has no primary network profile; set network_profile on the request",
                    hypervisor.id
                ),
            })?,
    };
    Ok(Placement {
        hypervisor_id: hypervisor.id.clone(),
        network_profile_id: network.id.clone(),
    })
}

fn select_hypervisor<'a>(
    request: &ServerRequest,
    hypervisors: &'a [Hypervisor],
    configured_default: Option<&str>,
) -> Result<&'a Hypervisor, ProviderError> {
    let by_key = |wanted: &str| {
        hypervisors
            .iter()
            .find(|candidate| candidate.id == wanted || candidate.name == wanted)
    };
    if let Some(wanted) = request.hypervisor.as_deref() {
        return by_key(wanted).ok_or_else(|| ProviderError::Provisioning {
            resource: "hypervisor".to_owned(),
            message: format!("hypervisor '{wanted}' is not available"),
        });
    }
    if let Some(wanted) = configured_default {
        return by_key(wanted).ok_or_else(|| ProviderError::Provisioning {
            resource: "hypervisor".to_owned(),
            message: format!("configured default hypervisor '{wanted}' is not available"),
        });
    }
    hypervisors
        .iter()
        .find(|candidate| candidate.default)
        .ok_or_else(|| ProviderError::Provisioning {
            resource: "hypervisor".to_owned(),
            message: format!(
                "no hypervisor requested for region {} and the provider flags no default; \
                 set hypervisor on the request",
                request.region
            ),
        })
}
