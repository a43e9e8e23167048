//! End-to-end task scenarios against the mock provider and a scripted SSH
//! runner.

use std::sync::Arc;
use std::time::Duration;

use provisio::payload::CommandOutput;
use provisio::provider::mock::MockProvider;
use provisio::provider::{Hypervisor, NetworkProfile};
use provisio::test_support::{RecordingNotifier, ScriptedRunner};
use provisio::{
    CreateInstancesRequest, DeleteUploadRequest, Engine, EngineConfig, EngineParts,
    InMemoryRepository, Instance, InstanceId, InstanceRequest, InstanceStatus, OwnerId,
    PayloadConfig, PayloadDeployer, PayloadSpec, PayloadStatus, Project, ProviderRegistry,
    Repository, SshKey, Task, TaskAction, TaskStatus, TerminateInstancesRequest,
};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

const OWNER: OwnerId = OwnerId::new(11);

fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        max_fanout: 4,
        call_timeout_secs: 5,
        retry_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        poll_interval_ms: 2,
        ready_timeout_secs: 5,
        ..EngineConfig::with_defaults()
    }
}

struct World {
    repo: Arc<InMemoryRepository>,
    mock: MockProvider,
    runner: ScriptedRunner,
    notifier: RecordingNotifier,
    engine: Engine,
    project: Project,
}

impl World {
    async fn start() -> Self {
        Self::start_with(MockProvider::new(), Arc::new(InMemoryRepository::new())).await
    }

    async fn start_with(mock: MockProvider, repo: Arc<InMemoryRepository>) -> Self {
        Self::start_configured(&fast_config(), mock, repo).await
    }

    async fn start_configured(
        config: &EngineConfig,
        mock: MockProvider,
        repo: Arc<InMemoryRepository>,
    ) -> Self {
        let runner = ScriptedRunner::new();
        let notifier = RecordingNotifier::new();
        let deployer = PayloadDeployer::new(PayloadConfig::with_defaults(), Arc::new(runner.clone()))
            .unwrap_or_else(|err| panic!("deployer: {err}"))
            .with_retry(config.retry_policy());
        let engine = Engine::start(
            config,
            EngineParts {
                repo: repo.clone(),
                providers: ProviderRegistry::new().with(mock.clone()),
                deployer,
                notifier: Arc::new(notifier.clone()),
            },
        )
        .await
        .unwrap_or_else(|err| panic!("engine: {err}"));

        let project = match repo.list_projects(Some(OWNER)).await {
            Ok(projects) if !projects.is_empty() => projects
                .into_iter()
                .next()
                .unwrap_or_else(|| panic!("project expected")),
            _ => engine
                .projects()
                .create(OWNER, "demo", "integration", json!({}))
                .await
                .unwrap_or_else(|err| panic!("project: {err}")),
        };
        if repo.get_ssh_key(OWNER, "deploy").await.is_err() {
            engine
                .ssh_keys()
                .create(OWNER, "deploy", "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5 ci@example")
                .await
                .unwrap_or_else(|err| panic!("key: {err}"));
        }

        Self {
            repo,
            mock,
            runner,
            notifier,
            engine,
            project,
        }
    }

    async fn create(&self, names: &[&str], payload: Option<PayloadSpec>) -> Task {
        let request = CreateInstancesRequest {
            instances: names.iter().map(|name| instance(name)).collect(),
            payload,
            webhook_url: None,
        };
        self.engine
            .tasks()
            .create_instances(OWNER, &self.project.id, &request)
            .await
            .unwrap_or_else(|err| panic!("create: {err}"))
    }

    async fn finish(&self, task: &Task) -> Task {
        self.engine
            .tasks()
            .wait_until_terminal(OWNER, &task.id, Duration::from_millis(5), Duration::from_secs(10))
            .await
            .unwrap_or_else(|err| panic!("wait: {err}"))
    }

    async fn instance(&self, id: &InstanceId) -> Instance {
        self.repo
            .get_instance(id)
            .await
            .unwrap_or_else(|err| panic!("instance: {err}"))
    }

    async fn instances(&self, task: &Task) -> Vec<Instance> {
        let mut instances = Vec::new();
        for id in &task.instance_ids {
            instances.push(self.instance(id).await);
        }
        instances
    }
}

fn instance(name: &str) -> InstanceRequest {
    InstanceRequest::new("mock", "mock-1", "small", "debian-12", "deploy").named(name)
}

fn payload_file() -> (TempDir, PayloadSpec) {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let path = dir.path().join("bootstrap.sh");
    std::fs::write(&path, "#!/bin/sh\necho ok\n").unwrap_or_else(|err| panic!("write: {err}"));
    (dir, PayloadSpec::new(path.to_string_lossy().into_owned()))
}

#[tokio::test]
async fn mock_create_completes_with_ready_instances() {
    let world = World::start().await;
    let accepted = world.create(&["web-1", "web-2"], None).await;
    assert_eq!(accepted.status, TaskStatus::Pending);
    assert_eq!(accepted.instance_ids.len(), 2);

    let finished = world.finish(&accepted).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.error, None);
    assert!(finished.started_at.is_some() && finished.finished_at.is_some());
    for instance in world.instances(&finished).await {
        assert_eq!(instance.status, InstanceStatus::Ready);
        assert!(
            instance
                .provider_instance_id
                .as_deref()
                .is_some_and(|id| !id.is_empty())
        );
    }
    world.engine.shutdown().await;
}

#[rstest]
#[case(4, 2)]
#[case(3, 1)]
#[tokio::test]
async fn partial_failures_complete_and_name_the_failed_instances(
    #[case] total: usize,
    #[case] failing: usize,
) {
    let world = World::start().await;
    let names: Vec<String> = (1..=total).map(|index| format!("node-{index}")).collect();
    for name in names.iter().take(failing) {
        world.mock.fail_create(name, "capacity exhausted");
    }
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let finished = world.finish(&world.create(&refs, None).await).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    let error = finished.error.clone().unwrap_or_default();
    let instances = world.instances(&finished).await;
    let (failed, ready): (Vec<&Instance>, Vec<&Instance>) = instances
        .iter()
        .partition(|instance| instance.status == InstanceStatus::Terminated);
    assert_eq!(failed.len(), failing);
    assert_eq!(ready.len(), total - failing);
    for instance in &failed {
        assert!(error.contains(instance.id.as_str()), "{error}");
    }
    for instance in &ready {
        assert_eq!(instance.status, InstanceStatus::Ready);
        assert!(!error.contains(instance.id.as_str()), "{error}");
    }
    world.engine.shutdown().await;
}

#[tokio::test]
async fn a_batch_with_no_success_fails() {
    let world = World::start().await;
    world.mock.fail_create("web-1", "image not found");
    let finished = world.finish(&world.create(&["web-1"], None).await).await;

    assert_eq!(finished.status, TaskStatus::Failed);
    assert!(finished.error.unwrap_or_default().contains("image not found"));
    world.engine.shutdown().await;
}

#[tokio::test]
async fn terminating_instances_missing_at_the_provider_completes() {
    let world = World::start().await;
    let created = world.finish(&world.create(&["web-1"], None).await).await;
    let Some(instance) = world.instances(&created).await.into_iter().next() else {
        panic!("instance expected");
    };
    world
        .mock
        .forget(instance.provider_instance_id.as_deref().unwrap_or_default());

    let request = TerminateInstancesRequest {
        instances: vec!["web-1".to_owned()],
        webhook_url: None,
    };
    let accepted = world
        .engine
        .tasks()
        .terminate_instances(OWNER, &world.project.id, &request)
        .await
        .unwrap_or_else(|err| panic!("terminate: {err}"));
    let finished = world.finish(&accepted).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(world.instance(&instance.id).await.status, InstanceStatus::Terminated);

    let again = world
        .engine
        .tasks()
        .terminate(OWNER, &finished.id)
        .await
        .unwrap_or_else(|err| panic!("terminate task: {err}"));
    assert_eq!(again.status, TaskStatus::Completed);
    world.engine.shutdown().await;
}

#[tokio::test]
async fn terminating_during_a_create_retry_removes_the_late_server() {
    let config = EngineConfig {
        retry_base_delay_ms: 200,
        retry_max_delay_ms: 400,
        ..fast_config()
    };
    let mock = MockProvider::new();
    mock.fail_create_transiently("web-1", 1);
    let world =
        World::start_configured(&config, mock, Arc::new(InMemoryRepository::new())).await;
    let create = world.create(&["web-1"], None).await;
    let Some(instance_id) = create.instance_ids.first().cloned() else {
        panic!("instance expected");
    };
    for _ in 0..200 {
        if world.instance(&instance_id).await.status == InstanceStatus::Provisioning {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    world
        .engine
        .tasks()
        .terminate(OWNER, &create.id)
        .await
        .unwrap_or_else(|err| panic!("terminate task: {err}"));
    let request = TerminateInstancesRequest {
        instances: vec!["web-1".to_owned()],
        webhook_url: None,
    };
    let teardown = world
        .engine
        .tasks()
        .terminate_instances(OWNER, &world.project.id, &request)
        .await
        .unwrap_or_else(|err| panic!("terminate instances: {err}"));
    let finished = world.finish(&teardown).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    let instance = world.instance(&instance_id).await;
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert!(instance.provider_instance_id.is_some(), "{instance:?}");
    assert!(world.mock.live_servers().is_empty(), "{:?}", world.mock.live_servers());
    assert_eq!(world.mock.deleted_ids().len(), 1);
    world.engine.shutdown().await;
}

#[tokio::test]
async fn payload_copy_failures_leave_instances_ready() {
    let world = World::start().await;
    world
        .runner
        .respond_when("mkdir -p", CommandOutput::failure(255, "ssh: connect to host: Connection refused"));
    let (_dir, payload) = payload_file();

    let finished = world
        .finish(&world.create(&["web-1"], Some(payload)).await)
        .await;

    assert_eq!(finished.status, TaskStatus::Completed);
    assert!(
        finished
            .error
            .as_deref()
            .is_some_and(|error| error.contains("payload")),
        "{:?}",
        finished.error
    );
    let Some(instance) = world.instances(&finished).await.into_iter().next() else {
        panic!("instance expected");
    };
    assert_eq!(instance.status, InstanceStatus::Ready);
    assert_eq!(instance.payload_status, PayloadStatus::CopyFailed);
    world.engine.shutdown().await;
}

#[tokio::test]
async fn uploads_can_be_deleted_after_deployment() {
    let world = World::start().await;
    let (_dir, payload) = payload_file();
    let created = world
        .finish(&world.create(&["web-1"], Some(payload)).await)
        .await;
    assert_eq!(created.status, TaskStatus::Completed);
    let Some(id) = created.instance_ids.first() else {
        panic!("instance expected");
    };
    assert_eq!(world.instance(id).await.payload_status, PayloadStatus::Executed);

    let accepted = world
        .engine
        .tasks()
        .delete_upload(
            OWNER,
            &world.project.id,
            &DeleteUploadRequest {
                instances: vec!["web-1".to_owned()],
                remote_path: None,
                webhook_url: None,
            },
        )
        .await
        .unwrap_or_else(|err| panic!("delete upload: {err}"));
    let finished = world.finish(&accepted).await;

    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(world.instance(id).await.payload_status, PayloadStatus::None);
    assert!(
        world
            .runner
            .invocations()
            .iter()
            .any(|call| call.command_string().ends_with("rm -rf -- /opt/provisio"))
    );
    world.engine.shutdown().await;
}

#[rstest]
#[case(true, TaskStatus::Completed)]
#[case(false, TaskStatus::Failed)]
#[tokio::test]
async fn network_falls_back_to_the_primary_profile(
    #[case] has_primary: bool,
    #[case] expected: TaskStatus,
) {
    let mock = MockProvider::with_hypervisors(vec![Hypervisor {
        id: "hv-1".to_owned(),
        name: "hv".to_owned(),
        region: "mock-1".to_owned(),
        default: true,
        networks: vec![NetworkProfile {
            id: "net-1".to_owned(),
            name: "public".to_owned(),
            primary: has_primary,
        }],
    }]);
    let world = World::start_with(mock, Arc::new(InMemoryRepository::new())).await;

    let finished = world.finish(&world.create(&["web-1"], None).await).await;

    assert_eq!(finished.status, expected);
    if !has_primary {
        assert!(
            finished.error.as_deref().is_some_and(|error| error.contains("network")),
            "{:?}",
            finished.error
        );
    }
    world.engine.shutdown().await;
}

#[tokio::test]
async fn webhooks_fire_once_tasks_finish() {
    let world = World::start().await;
    let request = CreateInstancesRequest {
        instances: vec![instance("web-1")],
        payload: None,
        webhook_url: Some("https://hooks.example.com/provisio".to_owned()),
    };
    let accepted = world
        .engine
        .tasks()
        .create_instances(OWNER, &world.project.id, &request)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    world.finish(&accepted).await;

    let mut sent = false;
    for _ in 0..200 {
        let task = world
            .engine
            .tasks()
            .get(OWNER, &accepted.id)
            .await
            .unwrap_or_else(|err| panic!("get: {err}"));
        if task.webhook_sent {
            sent = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(sent, "webhook_sent never set");
    let deliveries = world.notifier.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(
        deliveries.first().map(|(_, task)| task.status),
        Some(TaskStatus::Completed)
    );
    world.engine.shutdown().await;
}

#[tokio::test]
async fn restart_fails_running_tasks_and_resumes_pending_ones() {
    let repo = Arc::new(InMemoryRepository::new());
    let project = repo
        .insert_project(Project::new(OWNER, "demo", "", json!({})))
        .await
        .unwrap_or_else(|err| panic!("project: {err}"));
    repo.insert_ssh_key(SshKey::new(OWNER, "deploy", "ssh-ed25519 AAAAC3Nz"))
        .await
        .unwrap_or_else(|err| panic!("key: {err}"));

    let mut interrupted = Task::new(
        OWNER,
        project.id.clone(),
        TaskAction::TerminateInstances,
        json!({ "instances": ["gone"] }),
        None,
    );
    interrupted
        .transition(TaskStatus::Running)
        .unwrap_or_else(|err| panic!("running: {err}"));
    let interrupted = repo
        .insert_task(interrupted)
        .await
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let body = json!({ "instances": [instance("web-1")] });
    let mut pending = Task::new(
        OWNER,
        project.id.clone(),
        TaskAction::CreateInstances,
        body,
        None,
    );
    let row = Instance::pending(
        OWNER,
        project.id.clone(),
        pending.id.clone(),
        "web-1".to_owned(),
        &instance("web-1"),
    );
    pending.instance_ids = vec![row.id.clone()];
    repo.insert_instances(vec![row])
        .await
        .unwrap_or_else(|err| panic!("instances: {err}"));
    let pending = repo
        .insert_task(pending)
        .await
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let world = World::start_with(MockProvider::new(), repo).await;
    assert_eq!(world.engine.recovery().interrupted, 1);
    assert_eq!(world.engine.recovery().requeued, 1);

    let failed = world.finish(&interrupted).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error.unwrap_or_default().contains("worker stopped"));

    let resumed = world.finish(&pending).await;
    assert_eq!(resumed.status, TaskStatus::Completed);
    world.engine.shutdown().await;
}
