//! Command-line interface definitions for the `provisio` binary.
//!
//! The parser lives in its own module so the build script can reuse it when
//! generating the manual page.

use clap::Parser;

/// Top-level CLI for the `provisio` binary.
#[derive(Debug, Parser)]
#[command(
    name = "provisio",
    about = "Provision and tear down instances through the task engine",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create the instances described by a request file and wait for them.
    #[command(
        name = "provision",
        about = "Create instances from a request file and wait for the task"
    )]
    Provision(ProvisionCommand),
    /// Terminate the instances recorded in a delete file.
    #[command(
        name = "teardown",
        about = "Terminate the instances recorded in a delete file"
    )]
    Teardown(TeardownCommand),
}

/// Arguments for `provisio provision`.
#[derive(Debug, Parser)]
pub(crate) struct ProvisionCommand {
    /// JSON request: `project`, optional `ssh_keys` (name to public key) and
    /// the create body (`instances`, `payload`, `webhook_url`).
    #[arg(long, value_name = "FILE")]
    pub(crate) request: String,
    /// Where to write the delete file; defaults to `<request>.delete.json`
    /// next to the request.
    #[arg(long, value_name = "PATH")]
    pub(crate) delete_file: Option<String>,
    /// Give up waiting for the task after this many seconds.
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    pub(crate) timeout_secs: u64,
}

/// Arguments for `provisio teardown`.
#[derive(Debug, Parser)]
pub(crate) struct TeardownCommand {
    /// Delete file written by `provisio provision`.
    #[arg(long, value_name = "FILE")]
    pub(crate) delete_file: String,
    /// Give up waiting for the task after this many seconds.
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    pub(crate) timeout_secs: u64,
}
