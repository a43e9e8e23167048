//! Payload sub-state machine on ready instances.
//!
//! `none → pending_copy → copied | copy_failed`, then
//! `copied → pending_execution → executed | execution_failed`. Payload
//! failures are recorded on the instance but never move its lifecycle status.

use tracing::warn;

use super::{InstanceLifecycleController, InstanceOutcome, InstanceReport};
use crate::model::{Instance, PayloadSpec, PayloadStatus};
use crate::payload::DeployTarget;

impl InstanceLifecycleController {
    pub(super) async fn deploy_payload(
        &self,
        mut instance: Instance,
        payload: &PayloadSpec,
    ) -> InstanceReport {
        let target = match DeployTarget::for_instance(&instance) {
            Ok(target) => target,
            Err(err) => {
                return self
                    .payload_failed(instance, PayloadStatus::CopyFailed, format!("payload copy failed: {err}"))
                    .await;
            }
        };

        instance = match self.advance(instance, PayloadStatus::PendingCopy).await {
            Ok(instance) => instance,
            Err(report) => return report,
        };
        if let Err(err) = self.deployer.copy(&target, payload).await {
            return self
                .payload_failed(instance, PayloadStatus::CopyFailed, format!("payload copy failed: {err}"))
                .await;
        }
        instance = match self.advance(instance, PayloadStatus::Copied).await {
            Ok(instance) => instance,
            Err(report) => return report,
        };

        instance = match self.advance(instance, PayloadStatus::PendingExecution).await {
            Ok(instance) => instance,
            Err(report) => return report,
        };
        if let Err(err) = self.deployer.execute(&target, payload).await {
            return self
                .payload_failed(
                    instance,
                    PayloadStatus::ExecutionFailed,
                    format!("payload execution failed: {err}"),
                )
                .await;
        }
        match self.advance(instance, PayloadStatus::Executed).await {
            Ok(instance) => InstanceReport::new(&instance, InstanceOutcome::Succeeded),
            Err(report) => report,
        }
    }

    async fn advance(
        &self,
        mut instance: Instance,
        next: PayloadStatus,
    ) -> Result<Instance, InstanceReport> {
        if let Err(err) = instance.set_payload_status(next) {
            return Err(InstanceReport::new(
                &instance,
                InstanceOutcome::PayloadFailed(err.to_string()),
            ));
        }
        match self.save(instance.clone()).await {
            Ok(saved) => Ok(saved),
            Err(err) => Err(InstanceReport::new(
                &instance,
                InstanceOutcome::PayloadFailed(err.to_string()),
            )),
        }
    }

    async fn payload_failed(
        &self,
        mut instance: Instance,
        status: PayloadStatus,
        message: String,
    ) -> InstanceReport {
        warn!(instance_id = %instance.id, error = %message, "payload step failed");
        if instance.payload_status == PayloadStatus::None
            && status == PayloadStatus::CopyFailed
            && let Err(err) = instance.set_payload_status(PayloadStatus::PendingCopy)
        {
            warn!(instance_id = %instance.id, error = %err, "payload status not advanced");
        }
        if let Err(err) = instance.set_payload_status(status) {
            warn!(instance_id = %instance.id, error = %err, "payload status not advanced");
        }
        instance.error = Some(message.clone());
        let report = InstanceReport::new(&instance, InstanceOutcome::PayloadFailed(message));
        if let Err(err) = self.save(instance).await {
            warn!(instance_id = %report.instance_id, error = %err, "failed to persist payload failure");
        }
        report
    }
}
