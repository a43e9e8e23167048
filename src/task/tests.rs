//! Unit tests for task intake, queries and termination.

use std::time::Duration;

use rstest::rstest;
use serde_json::json;
use tokio::sync::mpsc;

use super::*;
use crate::model::{ADMIN_ID, InstanceStatus, SshKey};
use crate::provider::mock::MockProvider;
use crate::repository::InMemoryRepository;
use crate::retry::RetryPolicy;
use crate::test_support::RecordingNotifier;

const OWNER: OwnerId = OwnerId::new(7);
const STRANGER: OwnerId = OwnerId::new(8);

struct Harness {
    repo: Arc<InMemoryRepository>,
    manager: TaskManager,
    queue: mpsc::Receiver<TaskId>,
    notifier: RecordingNotifier,
    project: Project,
}

async fn harness() -> Harness {
    let repo = Arc::new(InMemoryRepository::new());
    let project = repo
        .insert_project(Project::new(OWNER, "demo", "", json!({})))
        .await
        .unwrap_or_else(|err| panic!("project: {err}"));
    repo.insert_ssh_key(SshKey::new(OWNER, "deploy", "ssh-ed25519 AAAAC3Nz test"))
        .await
        .unwrap_or_else(|err| panic!("key: {err}"));
    let notifier = RecordingNotifier::new();
    let webhooks = WebhookDispatcher::new(
        repo.clone(),
        Arc::new(notifier.clone()),
        RetryPolicy::single_attempt(Duration::from_secs(1)),
    );
    let (sender, queue) = mpsc::channel(16);
    let providers = Arc::new(ProviderRegistry::new().with(MockProvider::new()));
    let manager = TaskManager::new(repo.clone(), providers, sender, webhooks);
    Harness {
        repo,
        manager,
        queue,
        notifier,
        project,
    }
}

fn create_body(names: &[&str]) -> Value {
    let instances: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "provider": "mock",
                "region": "mock-1",
                "size": "small",
                "image": "debian-12",
                "ssh_key_name": "deploy",
            })
        })
        .collect();
    json!({ "instances": instances, "webhook_url": "https://hooks.example.com/done" })
}

impl Harness {
    async fn create(&self, names: &[&str]) -> Task {
        self.manager
            .create_task(
                OWNER,
                &self.project.id,
                TaskAction::CreateInstances,
                create_body(names),
            )
            .await
            .unwrap_or_else(|err| panic!("create: {err}"))
    }

    async fn complete(&self, task: &Task) {
        for status in [TaskStatus::Running, TaskStatus::Completed] {
            self.manager
                .update_status(OWNER, &task.id, status)
                .await
                .unwrap_or_else(|err| panic!("update: {err}"));
        }
    }

    async fn terminate_request(&self, identifiers: &[&str]) -> Result<Task, EngineError> {
        self.manager
            .terminate_instances(
                OWNER,
                &self.project.id,
                &TerminateInstancesRequest {
                    instances: identifiers.iter().map(|id| (*id).to_owned()).collect(),
                    webhook_url: None,
                },
            )
            .await
    }
}

#[tokio::test]
async fn accepted_creates_are_pending_and_queued() {
    let mut harness = harness().await;
    let task = harness.create(&["web-1", "web-2"]).await;

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.owner_id, OWNER);
    assert_eq!(task.instance_ids.len(), 2);
    assert_eq!(task.webhook_url.as_deref(), Some("https://hooks.example.com/done"));
    for id in &task.instance_ids {
        let instance = harness
            .repo
            .get_instance(id)
            .await
            .unwrap_or_else(|err| panic!("instance: {err}"));
        assert_eq!(instance.status, InstanceStatus::Pending);
        assert_eq!(instance.last_task_id.as_ref(), Some(&task.id));
    }
    assert_eq!(harness.queue.try_recv().ok(), Some(task.id));
}

#[rstest]
#[case(json!({ "instances": [] }), "at least one")]
#[case(json!({ "instances": [{ "provider": "nimbus", "region": "r", "size": "s", "image": "i", "ssh_key_name": "deploy" }] }), "nimbus")]
#[case(json!({ "instances": [{ "provider": "mock", "region": "r", "size": "s", "image": "i", "ssh_key_name": "missing" }] }), "ssh key 'missing'")]
#[case(json!({ "instances": [{ "provider": "mock", "size": "s", "image": "i", "ssh_key_name": "deploy" }] }), "region")]
#[tokio::test]
async fn invalid_creates_are_rejected_synchronously(#[case] body: Value, #[case] mention: &str) {
    let mut harness = harness().await;
    let err = harness
        .manager
        .create_task(OWNER, &harness.project.id, TaskAction::CreateInstances, body)
        .await
        .expect_err("request should be rejected");

    assert_eq!(err.http_status(), 400, "{err}");
    assert!(err.to_string().contains(mention), "{err}");
    assert!(harness.queue.try_recv().is_err());
}

#[tokio::test]
async fn unknown_providers_list_the_registered_ones() {
    let harness = harness().await;
    let body = json!({ "instances": [{ "provider": "nimbus", "region": "r", "size": "s", "image": "i", "ssh_key_name": "deploy" }] });
    let err = harness
        .manager
        .create_task(OWNER, &harness.project.id, TaskAction::CreateInstances, body)
        .await
        .expect_err("unknown provider");
    assert!(err.to_string().contains("registered providers: mock"), "{err}");
}

#[tokio::test]
async fn other_owners_cannot_see_projects_or_tasks() {
    let harness = harness().await;
    let task = harness.create(&["web-1"]).await;

    let err = harness
        .manager
        .create_task(
            STRANGER,
            &harness.project.id,
            TaskAction::CreateInstances,
            create_body(&["web-2"]),
        )
        .await
        .expect_err("foreign project");
    assert_eq!(err.http_status(), 404);

    let hidden = harness.manager.get(STRANGER, &task.id).await;
    assert!(matches!(hidden, Err(EngineError::NotFound { .. })));

    let visible = harness.manager.get(ADMIN_ID, &task.id).await;
    assert_eq!(visible.map(|found| found.id).ok(), Some(task.id));
}

#[tokio::test]
async fn active_names_cannot_be_reused() {
    let harness = harness().await;
    harness.create(&["web-1"]).await;

    let err = harness
        .manager
        .create_task(
            OWNER,
            &harness.project.id,
            TaskAction::CreateInstances,
            create_body(&["web-1"]),
        )
        .await
        .expect_err("name in use");
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn terminate_resolves_names_and_claims_instances() {
    let harness = harness().await;
    let created = harness.create(&["web-1"]).await;
    harness.complete(&created).await;

    let teardown = harness
        .terminate_request(&["web-1"])
        .await
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    assert_eq!(teardown.instance_ids, created.instance_ids);

    let busy = harness.terminate_request(&["web-1"]).await;
    assert!(matches!(busy, Err(EngineError::Conflict(_))), "{busy:?}");
}

#[tokio::test]
async fn instances_of_an_active_task_are_busy() {
    let harness = harness().await;
    let created = harness.create(&["web-1"]).await;
    let Some(id) = created.instance_ids.first() else {
        panic!("instance expected");
    };

    let busy = harness.terminate_request(&[id.as_str()]).await;
    assert!(matches!(busy, Err(EngineError::Conflict(_))), "{busy:?}");
}

#[tokio::test]
async fn duplicate_identifiers_target_one_instance() {
    let harness = harness().await;
    let created = harness.create(&["web-1"]).await;
    harness.complete(&created).await;
    let Some(id) = created.instance_ids.first() else {
        panic!("instance expected");
    };

    let teardown = harness
        .terminate_request(&["web-1", id.as_str()])
        .await
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    assert_eq!(teardown.instance_ids.len(), 1);
}

#[tokio::test]
async fn unknown_instances_are_not_found() {
    let harness = harness().await;
    let err = harness
        .terminate_request(&["ghost"])
        .await
        .expect_err("missing instance");
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn terminating_twice_is_a_no_op() {
    let harness = harness().await;
    let task = harness.create(&["web-1"]).await;

    let first = harness
        .manager
        .terminate(OWNER, &task.id)
        .await
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    let second = harness
        .manager
        .terminate(OWNER, &task.id)
        .await
        .unwrap_or_else(|err| panic!("terminate again: {err}"));

    assert_eq!(first.status, TaskStatus::Terminated);
    assert_eq!(second.status, TaskStatus::Terminated);
    assert_eq!(first.finished_at, second.finished_at);

    let sent = harness
        .manager
        .wait_until_terminal(OWNER, &task.id, Duration::from_millis(5), Duration::from_secs(1))
        .await
        .unwrap_or_else(|err| panic!("wait: {err}"));
    assert_eq!(sent.status, TaskStatus::Terminated);
    for _ in 0..100 {
        if !harness.notifier.deliveries().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(harness.notifier.deliveries().len(), 1);
}

#[tokio::test]
async fn status_updates_follow_the_state_machine() {
    let harness = harness().await;
    let task = harness.create(&["web-1"]).await;

    let running = harness
        .manager
        .update_status(OWNER, &task.id, TaskStatus::Running)
        .await
        .unwrap_or_else(|err| panic!("running: {err}"));
    assert!(running.started_at.is_some());

    let backwards = harness
        .manager
        .update_status(OWNER, &task.id, TaskStatus::Pending)
        .await;
    assert!(matches!(backwards, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn tasks_are_listed_per_instance_newest_first() {
    let harness = harness().await;
    let created = harness.create(&["web-1"]).await;
    harness.complete(&created).await;
    let teardown = harness
        .terminate_request(&["web-1"])
        .await
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    let Some(id) = created.instance_ids.first() else {
        panic!("instance expected");
    };

    let listed = harness
        .manager
        .list_by_instance(OWNER, id, ListOptions::default())
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    let ids: Vec<TaskId> = listed.into_iter().map(|task| task.id).collect();
    assert_eq!(ids, vec![teardown.id, created.id]);

    let creates_only = harness
        .manager
        .list_by_project(
            OWNER,
            &harness.project.id,
            ListOptions {
                action: Some(TaskAction::CreateInstances),
                ..ListOptions::default()
            },
        )
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert_eq!(creates_only.len(), 1);
}

#[tokio::test]
async fn waiting_on_an_idle_task_times_out() {
    let harness = harness().await;
    let task = harness.create(&["web-1"]).await;

    let err = harness
        .manager
        .wait_until_terminal(OWNER, &task.id, Duration::from_millis(2), Duration::from_millis(10))
        .await
        .expect_err("task never runs");
    assert!(err.to_string().contains("still pending"), "{err}");
}
