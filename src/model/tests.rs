//! Unit tests for status machines and request validation.

use rstest::rstest;
use serde_json::json;

use super::*;

fn ready_instance() -> Instance {
    let request = InstanceRequest::new("mock", "mock-1", "small", "debian-12", "deploy");
    let mut instance = Instance::pending(
        OwnerId::new(7),
        ProjectId::from("p1"),
        TaskId::from("t1"),
        "web-1".to_owned(),
        &request,
    );
    for status in [
        InstanceStatus::Provisioning,
        InstanceStatus::Created,
        InstanceStatus::Ready,
    ] {
        instance
            .transition(status)
            .unwrap_or_else(|err| panic!("advance to {status}: {err}"));
    }
    instance
}

#[rstest]
#[case(TaskStatus::Pending, TaskStatus::Running, true)]
#[case(TaskStatus::Pending, TaskStatus::Terminated, true)]
#[case(TaskStatus::Running, TaskStatus::Completed, true)]
#[case(TaskStatus::Running, TaskStatus::Pending, false)]
#[case(TaskStatus::Pending, TaskStatus::Completed, false)]
#[case(TaskStatus::Completed, TaskStatus::Terminated, false)]
#[case(TaskStatus::Terminated, TaskStatus::Running, false)]
fn task_transitions(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
    assert_eq!(from.can_transition_to(to), allowed);
}

#[rstest]
#[case(InstanceStatus::Pending, InstanceStatus::Ready, true)]
#[case(InstanceStatus::Provisioning, InstanceStatus::Created, true)]
#[case(InstanceStatus::Ready, InstanceStatus::Created, false)]
#[case(InstanceStatus::Created, InstanceStatus::Terminated, true)]
#[case(InstanceStatus::Terminated, InstanceStatus::Ready, false)]
#[case(InstanceStatus::Unknown, InstanceStatus::Pending, true)]
fn instance_transitions(
    #[case] from: InstanceStatus,
    #[case] to: InstanceStatus,
    #[case] allowed: bool,
) {
    assert_eq!(from.can_transition_to(to), allowed);
}

#[rstest]
#[case(PayloadStatus::None, PayloadStatus::PendingCopy, true)]
#[case(PayloadStatus::CopyFailed, PayloadStatus::PendingCopy, true)]
#[case(PayloadStatus::Copied, PayloadStatus::PendingExecution, true)]
#[case(PayloadStatus::ExecutionFailed, PayloadStatus::PendingExecution, true)]
#[case(PayloadStatus::Executed, PayloadStatus::None, true)]
#[case(PayloadStatus::None, PayloadStatus::Copied, false)]
#[case(PayloadStatus::PendingCopy, PayloadStatus::Executed, false)]
fn payload_transitions(
    #[case] from: PayloadStatus,
    #[case] to: PayloadStatus,
    #[case] allowed: bool,
) {
    assert_eq!(from.can_transition_to(to), allowed);
}

#[test]
fn task_transition_stamps_times() {
    let mut task = Task::new(
        OwnerId::new(1),
        ProjectId::from("p1"),
        TaskAction::CreateInstances,
        json!({}),
        None,
    );
    task.transition(TaskStatus::Running)
        .unwrap_or_else(|err| panic!("start: {err}"));
    assert!(task.started_at.is_some());
    assert!(task.finished_at.is_none());
    task.transition(TaskStatus::Completed)
        .unwrap_or_else(|err| panic!("finish: {err}"));
    assert!(task.finished_at.is_some());

    let Err(err) = task.transition(TaskStatus::Terminated) else {
        panic!("terminal task must not move");
    };
    assert!(matches!(err, TransitionError::Task { .. }));
}

#[test]
fn payload_requires_ready_instance() {
    let request = InstanceRequest::new("mock", "mock-1", "small", "debian-12", "deploy");
    let mut instance = Instance::pending(
        OwnerId::new(7),
        ProjectId::from("p1"),
        TaskId::from("t1"),
        "web-1".to_owned(),
        &request,
    );

    let Err(err) = instance.set_payload_status(PayloadStatus::PendingCopy) else {
        panic!("payload must wait for ready");
    };
    assert!(matches!(err, TransitionError::NotReady { .. }));
}

#[test]
fn terminated_instance_is_absorbing() {
    let mut instance = ready_instance();
    instance
        .transition(InstanceStatus::Terminated)
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    instance
        .transition(InstanceStatus::Terminated)
        .unwrap_or_else(|err| panic!("repeat terminate is a no-op: {err}"));
    assert!(instance.transition(InstanceStatus::Ready).is_err());
}

#[test]
fn payload_walks_full_path_on_ready_instance() {
    let mut instance = ready_instance();
    for status in [
        PayloadStatus::PendingCopy,
        PayloadStatus::Copied,
        PayloadStatus::PendingExecution,
        PayloadStatus::Executed,
        PayloadStatus::None,
    ] {
        instance
            .set_payload_status(status)
            .unwrap_or_else(|err| panic!("payload {status}: {err}"));
    }
}

#[rstest]
#[case("pending_copy", PayloadStatus::PendingCopy)]
#[case(" executed ", PayloadStatus::Executed)]
fn payload_status_parses_wire_names(#[case] raw: &str, #[case] expected: PayloadStatus) {
    assert_eq!(raw.parse::<PayloadStatus>(), Ok(expected));
}

#[test]
fn statuses_serialise_as_snake_case() {
    let value = serde_json::to_value(TaskAction::TerminateInstances)
        .unwrap_or_else(|err| panic!("serialise: {err}"));
    assert_eq!(value, json!("terminate_instances"));
    assert!("bogus".parse::<TaskStatus>().is_err());
}

#[test]
fn admin_sentinel_sees_everything() {
    assert!(ADMIN_ID.can_access(OwnerId::new(42)));
    assert!(OwnerId::new(42).can_access(OwnerId::new(42)));
    assert!(!OwnerId::new(41).can_access(OwnerId::new(42)));
}

#[rstest]
#[case(json!({"instances": []}), "at least one instance")]
#[case(
    json!({"instances": [{"provider": "mock", "region": "r", "size": "s", "image": "i"}]}),
    "instances[0].ssh_key_name is required"
)]
#[case(
    json!({"instances": [{"provider": "mock", "region": "r", "size": "s", "image": "i",
        "ssh_key_name": "k", "count": 0}]}),
    "count must be between"
)]
#[case(
    json!({"instances": [{"provider": "mock", "region": "r", "size": "s", "image": "i",
        "ssh_key_name": "k"}], "webhook_url": "ftp://example.com/hook"}),
    "unsupported scheme"
)]
#[case(json!({"instances": "nope"}), "malformed create_instances request")]
fn create_requests_are_validated(#[case] body: serde_json::Value, #[case] expected: &str) {
    let Err(err) = TaskRequest::parse(TaskAction::CreateInstances, &body) else {
        panic!("request should be rejected");
    };
    assert!(
        err.to_string().contains(expected),
        "unexpected message: {err}"
    );
}

#[test]
fn create_request_accepts_camel_case_key_name() {
    let body = json!({
        "instances": [{"provider": "mock", "region": "r", "size": "s", "image": "i",
            "sshKeyName": "deploy"}],
        "webhook_url": "https://hooks.example.com/done"
    });
    let parsed = TaskRequest::parse(TaskAction::CreateInstances, &body)
        .unwrap_or_else(|err| panic!("parse: {err}"));
    let TaskRequest::CreateInstances(request) = parsed else {
        panic!("expected create request");
    };
    let Some(first) = request.instances.first() else {
        panic!("expected one instance");
    };
    assert_eq!(first.ssh_key_name, "deploy");
    assert_eq!(first.count, 1);
}

#[test]
fn delete_upload_requires_absolute_path() {
    let body = json!({"instances": ["web-1"], "remote_path": "relative/dir"});
    let Err(err) = TaskRequest::parse(TaskAction::DeleteUpload, &body) else {
        panic!("relative path should be rejected");
    };
    assert!(err.to_string().contains("absolute"));
}
