//! Provisioning: create the server, wait for readiness, then hand over to
//! payload deployment.

use std::fmt::Display;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::{InstanceLifecycleController, InstanceOutcome, InstanceReport};
use crate::error::EngineError;
use crate::model::{Instance, InstanceStatus, PayloadSpec, TaskId};
use crate::provider::{
    ProviderAdapter, ProviderError, ServerRequest, ServerSnapshot, ServerStatus,
};
use crate::retry::millis;

impl InstanceLifecycleController {
    pub(super) async fn provision(
        &self,
        task_id: &TaskId,
        instance: Instance,
        payload: Option<&PayloadSpec>,
    ) -> InstanceReport {
        if instance.status.is_terminal() {
            return InstanceReport::new(
                &instance,
                InstanceOutcome::Failed("instance was terminated before provisioning".to_owned()),
            );
        }
        let adapter = match self.adapter(&instance) {
            Ok(adapter) => adapter,
            Err(err) => return self.abandon(instance, err.to_string()).await,
        };
        let request = match self.server_request(&instance).await {
            Ok(request) => request,
            Err(err) => return self.abandon(instance, err.to_string()).await,
        };

        let ready = match self.create_and_wait(task_id, instance, adapter.as_ref(), &request).await {
            Ok(ready) => ready,
            Err(report) => return report,
        };

        match payload {
            Some(spec) => self.deploy_payload(ready, spec).await,
            None => InstanceReport::new(&ready, InstanceOutcome::Succeeded),
        }
    }

    async fn server_request(&self, instance: &Instance) -> Result<ServerRequest, EngineError> {
        let key = self
            .repo
            .get_ssh_key(instance.owner_id, &instance.ssh_key_name)
            .await?;
        Ok(ServerRequest::builder()
            .name(instance.name.as_str())
            .size(instance.size.as_str())
            .image(instance.image.as_str())
            .region(instance.region.as_str())
            .hypervisor(instance.hypervisor.clone())
            .network_profile(instance.network_profile.clone())
            .resources(instance.resources)
            .ssh_key(key.public_key)
            .tags(instance.tags.clone())
            .build()?)
    }

    /// Issues the create call and polls until ready. Failures are already
    /// persisted on the returned report.
    async fn create_and_wait(
        &self,
        task_id: &TaskId,
        mut instance: Instance,
        adapter: &dyn ProviderAdapter,
        request: &ServerRequest,
    ) -> Result<Instance, InstanceReport> {
        instance.last_task_id = Some(task_id.clone());
        if let Err(err) = instance.transition(InstanceStatus::Provisioning) {
            return Err(self.abandon(instance, err.to_string()).await);
        }
        instance = self.persist(instance).await?;

        let created = self
            .settings
            .retry
            .run("create server", || adapter.create_server(request))
            .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(err) => return Err(self.abandon(instance, err.to_string()).await),
        };
        info!(
            instance_id = %instance.id,
            provider = adapter.name(),
            provider_instance_id = %handle.provider_instance_id,
            "server created"
        );
        instance.provider_instance_id = Some(handle.provider_instance_id.clone());
        if let Err(err) = instance.transition(InstanceStatus::Created) {
            let message = self
                .destroy_with_note(adapter, &handle.provider_instance_id, &err)
                .await;
            return Err(self.abandon(instance, message).await);
        }
        // A server whose id cannot be recorded is unreachable by teardown.
        instance = match self.save(instance.clone()).await {
            Ok(saved) => saved,
            Err(err) => {
                let message = self
                    .destroy_with_note(adapter, &handle.provider_instance_id, &err)
                    .await;
                return Err(self.abandon(instance, message).await);
            }
        };

        let snapshot = match self
            .wait_until_ready(adapter, &handle.provider_instance_id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let message = self
                    .destroy_with_note(adapter, &handle.provider_instance_id, &err)
                    .await;
                return Err(self.abandon(instance, message).await);
            }
        };

        instance.public_ip = snapshot.public_ip.map(|ip| ip.to_string());
        instance.error = None;
        if let Err(err) = instance.transition(InstanceStatus::Ready) {
            return Err(self.abandon(instance, err.to_string()).await);
        }
        let ready = self.persist(instance).await?;
        info!(instance_id = %ready.id, public_ip = ?ready.public_ip, "instance ready");
        Ok(ready)
    }

    async fn persist(&self, instance: Instance) -> Result<Instance, InstanceReport> {
        match self.save(instance.clone()).await {
            Ok(saved) => Ok(saved),
            Err(err) => Err(InstanceReport::new(
                &instance,
                InstanceOutcome::Failed(err.to_string()),
            )),
        }
    }

    async fn wait_until_ready(
        &self,
        adapter: &dyn ProviderAdapter,
        provider_instance_id: &str,
    ) -> Result<ServerSnapshot, ProviderError> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            let snapshot = self
                .settings
                .retry
                .run("get server", || adapter.get_server(provider_instance_id))
                .await?;
            if snapshot.is_ready() {
                return Ok(snapshot);
            }
            if snapshot.status == ServerStatus::Terminated {
                return Err(ProviderError::Permanent(format!(
                    "server {provider_instance_id} terminated while provisioning"
                )));
            }
            debug!(provider_instance_id, status = ?snapshot.status, "server not ready yet");
            if Instant::now() + self.settings.poll_interval > deadline {
                return Err(ProviderError::Timeout {
                    operation: format!("server {provider_instance_id} to become ready"),
                    after_ms: millis(self.settings.ready_timeout),
                });
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Best-effort delete of a server that never became usable. The returned
    /// message carries `err` and any teardown failure.
    async fn destroy_with_note<E: Display>(
        &self,
        adapter: &dyn ProviderAdapter,
        provider_instance_id: &str,
        err: &E,
    ) -> String {
        let teardown_error = self
            .settings
            .retry
            .run("delete server", || adapter.delete_server(provider_instance_id))
            .await
            .err()
            .filter(|teardown| !teardown.is_not_found());
        append_teardown_note(err.to_string(), teardown_error.as_ref())
    }
}

fn append_teardown_note<E: Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}
