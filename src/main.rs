//! Binary entry point for the provisio CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use provisio::{
    CreateInstancesRequest, DeleteFile, DeleteFileError, Engine, EngineConfig, EngineError,
    EngineParts, HttpWebhookNotifier, InMemoryRepository, InstanceFilter, OwnerId,
    PayloadConfig, PayloadDeployer, Project, ProviderRegistry, Repository, Task, TaskStatus,
    TerminateInstancesRequest,
};

mod cli;

use cli::{Cli, ProvisionCommand, TeardownCommand};

/// Identity the CLI acts as inside its in-process engine.
const CLI_OWNER: OwnerId = OwnerId::new(1);

/// Request file accepted by `provisio provision`.
#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    project: String,
    #[serde(default)]
    ssh_keys: BTreeMap<String, String>,
    #[serde(flatten)]
    body: CreateInstancesRequest,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid request file {path}: {message}")]
    Request { path: Utf8PathBuf, message: String },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    DeleteFile(#[from] DeleteFileError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("provisio=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Provision(command) => provision(command).await,
        Cli::Teardown(command) => teardown(command).await,
    }
}

async fn provision(args: ProvisionCommand) -> Result<i32, CliError> {
    let request_path = Utf8PathBuf::from(args.request);
    let request = read_request(&request_path)?;
    let delete_path = args
        .delete_file
        .map_or_else(|| DeleteFile::default_path(&request_path), Utf8PathBuf::from);

    let repo = Arc::new(InMemoryRepository::new());
    let (engine, config) = start_engine(Arc::clone(&repo)).await?;

    let project = engine
        .projects()
        .create(CLI_OWNER, &request.project, "", json!({}))
        .await?;
    for (name, public_key) in &request.ssh_keys {
        engine.ssh_keys().create(CLI_OWNER, name, public_key).await?;
    }

    let accepted = engine
        .tasks()
        .create_instances(CLI_OWNER, &project.id, &request.body)
        .await?;
    write_delete_file(repo.as_ref(), &project, &accepted, &delete_path).await?;

    let finished = wait(&engine, &config, &accepted, args.timeout_secs).await?;
    write_delete_file(repo.as_ref(), &project, &finished, &delete_path).await?;
    print_task(&finished)?;
    engine.shutdown().await;
    Ok(exit_code(&finished))
}

async fn teardown(args: TeardownCommand) -> Result<i32, CliError> {
    let delete_path = Utf8PathBuf::from(args.delete_file);
    let record = DeleteFile::read(&delete_path)?;
    let targets = record.live_instance_ids();
    if targets.is_empty() {
        writeln!(io::stderr(), "no live instances recorded in {delete_path}").ok();
        return Ok(0);
    }

    let repo = Arc::new(InMemoryRepository::new());
    let (project, instances) = record.restore(CLI_OWNER);
    repo.insert_project(project.clone())
        .await
        .map_err(EngineError::from)?;
    repo.insert_instances(instances)
        .await
        .map_err(EngineError::from)?;

    let (engine, config) = start_engine(repo).await?;
    let accepted = engine
        .tasks()
        .terminate_instances(
            CLI_OWNER,
            &project.id,
            &TerminateInstancesRequest {
                instances: targets,
                webhook_url: None,
            },
        )
        .await?;
    let finished = wait(&engine, &config, &accepted, args.timeout_secs).await?;
    print_task(&finished)?;
    engine.shutdown().await;
    Ok(exit_code(&finished))
}

async fn start_engine(repo: Arc<InMemoryRepository>) -> Result<(Engine, EngineConfig), CliError> {
    let config =
        EngineConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let payload_config =
        PayloadConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let deployer = PayloadDeployer::with_process_runner(payload_config)
        .map_err(|err| CliError::Config(err.to_string()))?;
    let engine = Engine::start(
        &config,
        EngineParts {
            repo,
            providers: ProviderRegistry::from_environment(),
            deployer,
            notifier: Arc::new(HttpWebhookNotifier::default()),
        },
    )
    .await?;
    Ok((engine, config))
}

async fn wait(
    engine: &Engine,
    config: &EngineConfig,
    task: &Task,
    timeout_secs: u64,
) -> Result<Task, CliError> {
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));
    Ok(engine
        .tasks()
        .wait_until_terminal(CLI_OWNER, &task.id, poll, Duration::from_secs(timeout_secs))
        .await?)
}

async fn write_delete_file(
    repo: &InMemoryRepository,
    project: &Project,
    task: &Task,
    path: &Utf8Path,
) -> Result<(), CliError> {
    let instances = repo
        .list_instances(&InstanceFilter {
            project_id: Some(project.id.clone()),
            ..InstanceFilter::default()
        })
        .await
        .map_err(EngineError::from)?;
    let created: Vec<_> = instances
        .into_iter()
        .filter(|instance| task.targets(&instance.id))
        .collect();
    DeleteFile::from_task(project, task, &created).write(path)?;
    Ok(())
}

fn read_request(path: &Utf8Path) -> Result<ProvisionRequest, CliError> {
    let request_error = |message: String| CliError::Request {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| request_error(String::from("path is missing a filename")))?;
    let contents = Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.read_to_string(file_name))
        .map_err(|err| request_error(err.to_string()))?;
    parse_request(&contents).map_err(request_error)
}

fn parse_request(contents: &str) -> Result<ProvisionRequest, String> {
    let request: ProvisionRequest =
        serde_json::from_str(contents).map_err(|err| err.to_string())?;
    if request.project.trim().is_empty() {
        return Err(String::from("project must not be empty"));
    }
    Ok(request)
}

fn print_task(task: &Task) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(task).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn exit_code(task: &Task) -> i32 {
    match (task.status, &task.error) {
        (TaskStatus::Completed, None) => 0,
        (TaskStatus::Completed, Some(_)) => 2,
        _ => 1,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
