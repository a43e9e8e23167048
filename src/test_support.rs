//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};

use tokio::sync::{Mutex, MutexGuard};

use crate::model::Task;
use crate::payload::{CommandFuture, CommandOutput, CommandRunner};
use crate::webhook::{WebhookError, WebhookFuture, WebhookNotifier};

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<(String, CommandOutput)>,
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner that never spawns processes.
///
/// Each call is answered by the first rule whose pattern occurs in the
/// rendered command line, else by the next queued response, else by a clean
/// exit.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    script: Arc<StdMutex<Script>>,
}

impl ScriptedRunner {
    /// Creates a runner with no rules or queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.script().invocations.clone()
    }

    /// Invocations of `program` only.
    #[must_use]
    pub fn invocations_of(&self, program: &str) -> Vec<CommandInvocation> {
        self.script()
            .invocations
            .iter()
            .filter(|invocation| invocation.program == program)
            .cloned()
            .collect()
    }

    /// Answers every command containing `pattern` with `output`.
    pub fn respond_when(&self, pattern: &str, output: CommandOutput) {
        self.script().rules.push((pattern.to_owned(), output));
    }

    /// Queues a successful exit status.
    pub fn push_success(&self) {
        self.push(CommandOutput::success());
    }

    /// Queues a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push(CommandOutput::failure(code, "simulated failure"));
    }

    /// Queues a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push(CommandOutput {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    /// Queues an explicit command output response.
    pub fn push(&self, output: CommandOutput) {
        self.script().responses.push_back(output);
    }

    fn script(&self) -> StdMutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn answer(&self, program: &str, args: &[OsString]) -> CommandOutput {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let rendered = invocation.command_string();
        let mut script = self.script();
        script.invocations.push(invocation);
        if let Some((_, output)) = script
            .rules
            .iter()
            .find(|(pattern, _)| rendered.contains(pattern.as_str()))
        {
            return output.clone();
        }
        script
            .responses
            .pop_front()
            .unwrap_or_else(CommandOutput::success)
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString]) -> CommandFuture<'a> {
        let output = self.answer(program, args);
        Box::pin(async move { Ok(output) })
    }
}

/// Webhook notifier that records deliveries in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    deliveries: Arc<StdMutex<Vec<(String, Task)>>>,
    reject_with: Arc<StdMutex<Option<u16>>>,
}

impl RecordingNotifier {
    /// Creates a notifier that accepts every delivery.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every later delivery with HTTP `status`.
    pub fn reject_with(&self, status: u16) {
        *self
            .reject_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    /// Accepted deliveries as `(url, task)` pairs.
    #[must_use]
    pub fn deliveries(&self) -> Vec<(String, Task)> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl WebhookNotifier for RecordingNotifier {
    fn notify<'a>(&'a self, url: &'a str, task: &'a Task) -> WebhookFuture<'a> {
        let rejection = *self
            .reject_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = match rejection {
            Some(status) => Err(WebhookError::Rejected {
                url: url.to_owned(),
                status,
            }),
            None => {
                self.deliveries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((url.to_owned(), task.clone()));
                Ok(())
            }
        };
        Box::pin(async move { outcome })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets (`Some`) or clears (`None`) environment variables while holding a
    /// global mutex.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
