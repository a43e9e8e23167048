//! In-process provider used by tests and dry runs.
//!
//! Servers advance from `provisioning` through `created` to `running` as they
//! are polled. Failures can be scripted per server name.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    Hypervisor, NetworkProfile, ProviderAdapter, ProviderError, ProviderFuture, ServerHandle,
    ServerRequest, ServerSnapshot, ServerStatus, select_placement,
};

/// Registry key of the mock adapter.
pub const MOCK_PROVIDER: &str = "mock";

const DEFAULT_POLLS_UNTIL_READY: u32 = 2;

#[derive(Clone, Debug)]
enum ScriptedFailure {
    Permanent(String),
    Transient { remaining: u32 },
}

#[derive(Clone, Debug)]
struct MockServer {
    name: String,
    status: ServerStatus,
    polls: u32,
    public_ip: IpAddr,
}

#[derive(Debug)]
struct MockState {
    next_id: u32,
    polls_until_ready: u32,
    reject_credentials: bool,
    hypervisors: Vec<Hypervisor>,
    servers: BTreeMap<String, MockServer>,
    create_failures: BTreeMap<String, ScriptedFailure>,
    created: Vec<ServerRequest>,
    deleted: Vec<String>,
}

/// Scriptable in-memory provider.
#[derive(Clone, Debug)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Creates a provider with one default hypervisor that has a primary
    /// network.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hypervisors(vec![Hypervisor {
            id: "hv-mock-1".to_owned(),
            name: "mock-hypervisor".to_owned(),
            region: "mock-1".to_owned(),
            default: true,
            networks: vec![NetworkProfile {
                id: "net-primary".to_owned(),
                name: "primary".to_owned(),
                primary: true,
            }],
        }])
    }

    /// Creates a provider exposing `hypervisors` for placement.
    #[must_use]
    pub fn with_hypervisors(hypervisors: Vec<Hypervisor>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 0,
                polls_until_ready: DEFAULT_POLLS_UNTIL_READY,
                reject_credentials: false,
                hypervisors,
                servers: BTreeMap::new(),
                create_failures: BTreeMap::new(),
                created: Vec::new(),
                deleted: Vec::new(),
            })),
        }
    }

    /// Sets how many `get_server` calls a new server needs before it reports
    /// running with an address.
    #[must_use]
    pub fn polls_until_ready(self, polls: u32) -> Self {
        self.state().polls_until_ready = polls.max(1);
        self
    }

    /// Makes every create for `server_name` fail permanently.
    pub fn fail_create(&self, server_name: &str, message: &str) {
        self.state().create_failures.insert(
            server_name.to_owned(),
            ScriptedFailure::Permanent(message.to_owned()),
        );
    }

    /// Makes the next `attempts` creates for `server_name` fail transiently.
    pub fn fail_create_transiently(&self, server_name: &str, attempts: u32) {
        self.state().create_failures.insert(
            server_name.to_owned(),
            ScriptedFailure::Transient {
                remaining: attempts,
            },
        );
    }

    /// Rejects all calls as unauthenticated.
    pub fn reject_credentials(&self) {
        self.state().reject_credentials = true;
    }

    /// Drops a server without recording a delete, as if removed out of band.
    pub fn forget(&self, provider_instance_id: &str) {
        self.state().servers.remove(provider_instance_id);
    }

    /// Create requests received so far.
    #[must_use]
    pub fn created_requests(&self) -> Vec<ServerRequest> {
        self.state().created.clone()
    }

    /// Provider ids deleted so far.
    #[must_use]
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Servers that currently exist.
    #[must_use]
    pub fn live_servers(&self) -> Vec<String> {
        self.state().servers.keys().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_credentials(state: &MockState) -> Result<(), ProviderError> {
        if state.reject_credentials {
            return Err(ProviderError::Auth {
                provider: MOCK_PROVIDER.to_owned(),
                message: "credentials rejected".to_owned(),
            });
        }
        Ok(())
    }

    fn create_now(&self, request: &ServerRequest) -> Result<ServerHandle, ProviderError> {
        request.validate()?;
        let mut state = self.state();
        Self::check_credentials(&state)?;

        match state.create_failures.get_mut(&request.name) {
            Some(ScriptedFailure::Permanent(message)) => {
                return Err(ProviderError::Permanent(message.clone()));
            }
            Some(ScriptedFailure::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                return Err(ProviderError::Transient(format!(
                    "scripted transient failure for {}",
                    request.name
                )));
            }
            _ => {}
        }

        if !state.hypervisors.is_empty() {
            select_placement(request, &state.hypervisors, None)?;
        }

        state.next_id = state.next_id.saturating_add(1);
        let id = format!("mock-{:06}", state.next_id);
        let address = Ipv4Addr::from(0x0A00_0000_u32 | (state.next_id & 0x00FF_FFFF));
        state.servers.insert(
            id.clone(),
            MockServer {
                name: request.name.clone(),
                status: ServerStatus::Provisioning,
                polls: 0,
                public_ip: IpAddr::V4(address),
            },
        );
        state.created.push(request.clone());
        Ok(ServerHandle {
            provider_instance_id: id,
            status: ServerStatus::Provisioning,
        })
    }

    fn poll_now(&self, provider_instance_id: &str) -> Result<ServerSnapshot, ProviderError> {
        let mut state = self.state();
        Self::check_credentials(&state)?;
        let polls_until_ready = state.polls_until_ready;
        let server = state
            .servers
            .get_mut(provider_instance_id)
            .ok_or_else(|| ProviderError::NotFound {
                id: provider_instance_id.to_owned(),
            })?;

        server.polls = server.polls.saturating_add(1);
        if matches!(
            server.status,
            ServerStatus::Provisioning | ServerStatus::Created
        ) {
            server.status = if server.polls >= polls_until_ready {
                ServerStatus::Running
            } else {
                ServerStatus::Created
            };
        }

        let public_ip = matches!(server.status, ServerStatus::Running).then_some(server.public_ip);
        Ok(ServerSnapshot {
            provider_instance_id: provider_instance_id.to_owned(),
            status: server.status,
            public_ip,
            metadata: BTreeMap::from([("name".to_owned(), server.name.clone())]),
        })
    }

    fn delete_now(&self, provider_instance_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        Self::check_credentials(&state)?;
        if state.servers.remove(provider_instance_id).is_none() {
            return Err(ProviderError::NotFound {
                id: provider_instance_id.to_owned(),
            });
        }
        state.deleted.push(provider_instance_id.to_owned());
        Ok(())
    }

    fn set_status(
        &self,
        provider_instance_id: &str,
        status: ServerStatus,
    ) -> Result<(), ProviderError> {
        let mut state = self.state();
        Self::check_credentials(&state)?;
        let server = state
            .servers
            .get_mut(provider_instance_id)
            .ok_or_else(|| ProviderError::NotFound {
                id: provider_instance_id.to_owned(),
            })?;
        server.status = status;
        Ok(())
    }
}

impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        MOCK_PROVIDER
    }

    fn connect(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move { Self::check_credentials(&self.state()) })
    }

    fn list_hypervisors(&self) -> ProviderFuture<'_, Vec<Hypervisor>> {
        Box::pin(async move {
            let state = self.state();
            Self::check_credentials(&state)?;
            Ok(state.hypervisors.clone())
        })
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> ProviderFuture<'a, ServerHandle> {
        Box::pin(async move { self.create_now(request) })
    }

    fn get_server<'a>(
        &'a self,
        provider_instance_id: &'a str,
    ) -> ProviderFuture<'a, ServerSnapshot> {
        Box::pin(async move { self.poll_now(provider_instance_id) })
    }

    fn delete_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.delete_now(provider_instance_id) })
    }

    fn suspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.set_status(provider_instance_id, ServerStatus::Suspended) })
    }

    fn unsuspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.set_status(provider_instance_id, ServerStatus::Running) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> ServerRequest {
        ServerRequest::builder()
            .name(name)
            .size("small")
            .image("debian-12")
            .region("mock-1")
            .build()
            .unwrap_or_else(|err| panic!("request: {err}"))
    }

    #[tokio::test]
    async fn servers_become_ready_after_polling() {
        let provider = MockProvider::new();
        let handle = provider
            .create_server(&request("web-1"))
            .await
            .unwrap_or_else(|err| panic!("create: {err}"));

        let first = provider
            .get_server(&handle.provider_instance_id)
            .await
            .unwrap_or_else(|err| panic!("poll: {err}"));
        assert_eq!(first.status, ServerStatus::Created);
        assert!(!first.is_ready());

        let second = provider
            .get_server(&handle.provider_instance_id)
            .await
            .unwrap_or_else(|err| panic!("poll: {err}"));
        assert!(second.is_ready());
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let provider = MockProvider::new();
        provider.fail_create_transiently("web-1", 1);

        let first = provider.create_server(&request("web-1")).await;
        assert!(matches!(first, Err(ProviderError::Transient(_))));
        assert!(provider.create_server(&request("web-1")).await.is_ok());
    }

    #[tokio::test]
    async fn deleting_unknown_server_is_not_found() {
        let provider = MockProvider::new();
        let result = provider.delete_server("mock-999999").await;
        assert!(result.is_err_and(|err| err.is_not_found()));
    }

    #[tokio::test]
    async fn missing_primary_network_fails_creation() {
        let provider = MockProvider::with_hypervisors(vec![Hypervisor {
            id: "hv-bare".to_owned(),
            name: "bare".to_owned(),
            region: "mock-1".to_owned(),
            default: true,
            networks: Vec::new(),
        }]);

        let Err(err) = provider.create_server(&request("web-1")).await else {
            panic!("creation should fail without a network");
        };
        assert!(err.to_string().contains("network"));
        assert!(provider.live_servers().is_empty());
    }
}
