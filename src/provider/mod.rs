//! Provider adapter contract.
//!
//! Each adapter turns the neutral [`ServerRequest`] into calls against one
//! hosting API and classifies failures into [`ProviderError`] so callers can
//! decide whether to retry.

use std::future::Future;
use std::pin::Pin;

pub mod digitalocean;
mod error;
mod http;
pub mod mock;
mod registry;
mod selection;
mod types;
pub mod virtfusion;

pub use error::ProviderError;
pub use registry::ProviderRegistry;
pub use selection::{Placement, select_placement};
pub use types::{
    Hypervisor, NetworkProfile, ServerHandle, ServerRequest, ServerRequestBuilder, ServerSnapshot,
    ServerStatus,
};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Interface implemented by hosting backends.
pub trait ProviderAdapter: Send + Sync {
    /// Registry key, for example `virtfusion`.
    fn name(&self) -> &str;

    /// Verifies that credentials are accepted.
    fn connect(&self) -> ProviderFuture<'_, ()>;

    /// Lists placement targets.
    fn list_hypervisors(&self) -> ProviderFuture<'_, Vec<Hypervisor>>;

    /// Creates a server and returns its provider identifier.
    fn create_server<'a>(&'a self, request: &'a ServerRequest)
    -> ProviderFuture<'a, ServerHandle>;

    /// Fetches the current state of a server.
    fn get_server<'a>(&'a self, provider_instance_id: &'a str)
    -> ProviderFuture<'a, ServerSnapshot>;

    /// Destroys a server. Unknown ids yield [`ProviderError::NotFound`].
    fn delete_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Suspends or powers off a server.
    fn suspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()>;

    /// Resumes a suspended server.
    fn unsuspend_server<'a>(&'a self, provider_instance_id: &'a str) -> ProviderFuture<'a, ()>;
}
