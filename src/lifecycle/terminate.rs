//! Teardown and upload removal.

use tracing::info;

use super::{InstanceLifecycleController, InstanceOutcome, InstanceReport};
use crate::model::{Instance, InstanceStatus, PayloadStatus};
use crate::payload::DeployTarget;

impl InstanceLifecycleController {
    pub(super) async fn terminate(&self, mut instance: Instance) -> InstanceReport {
        if instance.status == InstanceStatus::Terminated {
            return InstanceReport::new(&instance, InstanceOutcome::Succeeded);
        }

        if let Some(provider_instance_id) = instance.provider_instance_id.clone() {
            let adapter = match self.adapter(&instance) {
                Ok(adapter) => adapter,
                Err(err) => return self.report_failure(instance, err.to_string()).await,
            };
            let deleted = self
                .settings
                .retry
                .run("delete server", || adapter.delete_server(&provider_instance_id))
                .await;
            match deleted {
                Ok(()) => info!(instance_id = %instance.id, %provider_instance_id, "server deleted"),
                Err(err) if err.is_not_found() => {
                    info!(instance_id = %instance.id, %provider_instance_id, "server already gone");
                }
                Err(err) => return self.report_failure(instance, err.to_string()).await,
            }
        }

        if let Err(err) = instance.transition(InstanceStatus::Terminated) {
            return self.report_failure(instance, err.to_string()).await;
        }
        match self.save(instance.clone()).await {
            Ok(saved) => InstanceReport::new(&saved, InstanceOutcome::Succeeded),
            Err(err) => InstanceReport::new(&instance, InstanceOutcome::Failed(err.to_string())),
        }
    }

    pub(super) async fn delete_upload(
        &self,
        mut instance: Instance,
        remote_path: &str,
    ) -> InstanceReport {
        if instance.status != InstanceStatus::Ready {
            let message = format!("instance is {}, not ready", instance.status);
            return InstanceReport::new(&instance, InstanceOutcome::Failed(message));
        }
        if matches!(
            instance.payload_status,
            PayloadStatus::PendingCopy | PayloadStatus::PendingExecution
        ) {
            let message = format!("payload is {}", instance.payload_status);
            return InstanceReport::new(&instance, InstanceOutcome::Failed(message));
        }

        let target = match DeployTarget::for_instance(&instance) {
            Ok(target) => target,
            Err(err) => return self.report_failure(instance, err.to_string()).await,
        };
        if let Err(err) = self.deployer.remove(&target, remote_path).await {
            return self
                .report_failure(instance, format!("payload removal failed: {err}"))
                .await;
        }

        if let Err(err) = instance.set_payload_status(PayloadStatus::None) {
            return self.report_failure(instance, err.to_string()).await;
        }
        instance.error = None;
        match self.save(instance.clone()).await {
            Ok(saved) => InstanceReport::new(&saved, InstanceOutcome::Succeeded),
            Err(err) => InstanceReport::new(&instance, InstanceOutcome::Failed(err.to_string())),
        }
    }
}
