//! Unit tests for payload deployment.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::test_support::ScriptedRunner;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        call_timeout: Duration::from_secs(5),
    }
}

#[fixture]
fn target() -> DeployTarget {
    DeployTarget {
        instance_id: "inst-1".to_owned(),
        host: IpAddr::from([203, 0, 113, 10]),
        ssh_key_name: "deploy".to_owned(),
    }
}

#[fixture]
fn script_file() -> (TempDir, String) {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let path = dir.path().join("setup.sh");
    std::fs::write(&path, "#!/bin/sh\necho ready\n")
        .unwrap_or_else(|err| panic!("write payload: {err}"));
    let source = path.to_string_lossy().into_owned();
    (dir, source)
}

fn deployer(runner: &ScriptedRunner, config: PayloadConfig, attempts: u32) -> PayloadDeployer {
    PayloadDeployer::new(config, Arc::new(runner.clone()))
        .unwrap_or_else(|err| panic!("deployer: {err}"))
        .with_retry(fast_retry(attempts))
}

#[rstest]
#[case(PayloadConfig { ssh_bin: " ".to_owned(), ..PayloadConfig::with_defaults() }, "ssh_bin")]
#[case(PayloadConfig { remote_dir: "relative".to_owned(), ..PayloadConfig::with_defaults() }, "remote_dir")]
#[case(
    PayloadConfig { ssh_identity_dir: Some(String::new()), ..PayloadConfig::with_defaults() },
    "ssh_identity_dir"
)]
fn invalid_config_names_the_field(#[case] config: PayloadConfig, #[case] field: &str) {
    let Err(err) = PayloadDeployer::new(config, Arc::new(ScriptedRunner::new())) else {
        panic!("config should be rejected");
    };
    let message = err.to_string();
    assert!(message.contains(field), "message: {message}");
    assert!(message.contains("PROVISIO_PAYLOAD_"), "message: {message}");
}

#[test]
fn identity_dir_takes_precedence() {
    let config = PayloadConfig {
        ssh_identity_file: Some("/keys/shared".to_owned()),
        ssh_identity_dir: Some("/keys/".to_owned()),
        ..PayloadConfig::with_defaults()
    };
    assert_eq!(config.identity_for("deploy").as_deref(), Some("/keys/deploy"));

    let shared = PayloadConfig {
        ssh_identity_dir: None,
        ..config
    };
    assert_eq!(shared.identity_for("deploy").as_deref(), Some("/keys/shared"));
}

#[rstest]
#[case(PayloadSpec::new("/tmp/build/setup.sh"), "/opt/provisio/setup.sh")]
#[case(PayloadSpec::new("/tmp/bundle/"), "/opt/provisio/bundle")]
#[case(
    PayloadSpec { remote_name: Some("boot".to_owned()), ..PayloadSpec::new("/tmp/setup.sh") },
    "/opt/provisio/boot"
)]
fn remote_path_uses_file_name_or_override(#[case] payload: PayloadSpec, #[case] expected: &str) {
    let deployer = deployer(&ScriptedRunner::new(), PayloadConfig::with_defaults(), 1);
    assert_eq!(
        deployer
            .remote_path(&payload)
            .unwrap_or_else(|err| panic!("remote path: {err}")),
        expected
    );
}

#[rstest]
#[tokio::test]
async fn copy_creates_directory_then_uploads(
    target: DeployTarget,
    script_file: (TempDir, String),
) {
    let (_dir, source) = script_file;
    let runner = ScriptedRunner::new();
    let config = PayloadConfig {
        ssh_identity_dir: Some("/keys".to_owned()),
        ..PayloadConfig::with_defaults()
    };
    let deployer = deployer(&runner, config, 1);

    let remote = deployer
        .copy(&target, &PayloadSpec::new(source.as_str()))
        .await
        .unwrap_or_else(|err| panic!("copy: {err}"));

    assert_eq!(remote, "/opt/provisio/setup.sh");
    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 2);
    let mkdir = invocations
        .first()
        .map(|invocation| invocation.command_string())
        .unwrap_or_default();
    assert!(mkdir.starts_with("ssh -p 22 -i /keys/deploy"), "{mkdir}");
    assert!(mkdir.ends_with("root@203.0.113.10 mkdir -p /opt/provisio"), "{mkdir}");
    let upload = invocations
        .get(1)
        .map(|invocation| invocation.command_string())
        .unwrap_or_default();
    assert!(upload.starts_with("scp -P 22"), "{upload}");
    assert!(
        upload.ends_with(&format!("{source} root@203.0.113.10:/opt/provisio/setup.sh")),
        "{upload}"
    );
}

#[rstest]
#[tokio::test]
async fn copy_retries_then_gives_up(target: DeployTarget, script_file: (TempDir, String)) {
    let (_dir, source) = script_file;
    let runner = ScriptedRunner::new();
    runner.respond_when("mkdir -p", CommandOutput::failure(255, "Connection refused"));
    let deployer = deployer(&runner, PayloadConfig::with_defaults(), 3);

    let result = deployer.copy(&target, &PayloadSpec::new(source)).await;

    let Err(PayloadError::RetriesExhausted { attempts, last, .. }) = result else {
        panic!("expected exhausted retries, got {result:?}");
    };
    assert_eq!(attempts, 3);
    assert!(matches!(*last, PayloadError::Connection { .. }));
    assert_eq!(runner.invocations_of("scp").len(), 0);
}

#[rstest]
#[tokio::test]
async fn missing_source_is_not_retried(target: DeployTarget) {
    let runner = ScriptedRunner::new();
    let deployer = deployer(&runner, PayloadConfig::with_defaults(), 3);

    let result = deployer
        .copy(&target, &PayloadSpec::new("/definitely/not/here.sh"))
        .await;

    assert!(matches!(result, Err(PayloadError::MissingSource { .. })));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn execution_failure_is_reported_once(target: DeployTarget) {
    let runner = ScriptedRunner::new();
    runner.push(CommandOutput::failure(3, "boom"));
    let deployer = deployer(&runner, PayloadConfig::with_defaults(), 3);

    let result = deployer
        .execute(&target, &PayloadSpec::new("/tmp/setup.sh"))
        .await;

    assert_eq!(
        result,
        Err(PayloadError::ExecutionFailed {
            exit_code: 3,
            stderr: "boom".to_owned(),
        })
    );
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn execution_runs_command_from_remote_dir(target: DeployTarget) {
    let runner = ScriptedRunner::new();
    let deployer = deployer(&runner, PayloadConfig::with_defaults(), 1);
    let payload = PayloadSpec::new("/tmp/bundle").with_command("./install.sh --quiet");

    deployer
        .execute(&target, &payload)
        .await
        .unwrap_or_else(|err| panic!("execute: {err}"));

    let command = runner
        .invocations()
        .first()
        .map(|invocation| invocation.command_string())
        .unwrap_or_default();
    assert!(
        command.ends_with("cd /opt/provisio && ./install.sh --quiet"),
        "{command}"
    );
}

#[rstest]
#[case("")]
#[case("/")]
#[case("relative/path")]
#[tokio::test]
async fn removal_rejects_unsafe_paths(target: DeployTarget, #[case] path: &str) {
    let runner = ScriptedRunner::new();
    let deployer = deployer(&runner, PayloadConfig::with_defaults(), 1);

    let result = deployer.remove(&target, path).await;

    assert!(matches!(result, Err(PayloadError::UnsafePath { .. })));
    assert!(runner.invocations().is_empty());
}

#[rstest]
#[tokio::test]
async fn removal_escapes_the_path(target: DeployTarget) {
    let runner = ScriptedRunner::new();
    let deployer = deployer(&runner, PayloadConfig::with_defaults(), 1);

    deployer
        .remove(&target, "/opt/provisio/my payload")
        .await
        .unwrap_or_else(|err| panic!("remove: {err}"));

    let command = runner
        .invocations()
        .first()
        .map(|invocation| invocation.command_string())
        .unwrap_or_default();
    assert!(command.ends_with("rm -rf -- '/opt/provisio/my payload'"), "{command}");
}
