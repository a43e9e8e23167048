//! HTTP plumbing shared by the hosted adapters.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::ProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the client the registry hands to every hosted adapter.
pub(super) fn provider_client() -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|err| ProviderError::Config(format!("cannot build the HTTP client: {err}")))
}

/// Sends `request` and returns the status and body.
pub(super) async fn send(request: RequestBuilder) -> Result<(StatusCode, Vec<u8>), ProviderError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    let body = response.bytes().await.map_err(transport_error)?;
    Ok((status, body.to_vec()))
}

/// Sends `request` and decodes a JSON body on success.
pub(super) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: RequestBuilder,
    resource_id: Option<&str>,
) -> Result<T, ProviderError> {
    let (status, body) = send(request).await?;
    if !status.is_success() {
        return Err(classify_status(provider, status, &body, resource_id));
    }
    serde_json::from_slice(&body).map_err(|err| {
        ProviderError::Permanent(format!("{provider} returned an unexpected body: {err}"))
    })
}

/// Sends `request` and discards the body on success.
pub(super) async fn send_empty(
    provider: &str,
    request: RequestBuilder,
    resource_id: Option<&str>,
) -> Result<(), ProviderError> {
    let (status, body) = send(request).await?;
    if status.is_success() {
        return Ok(());
    }
    Err(classify_status(provider, status, &body, resource_id))
}

/// Maps an HTTP failure status onto the error taxonomy.
pub(super) fn classify_status(
    provider: &str,
    status: StatusCode,
    body: &[u8],
    resource_id: Option<&str>,
) -> ProviderError {
    let message = format!("{status}: {}", String::from_utf8_lossy(body).trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth {
            provider: provider.to_owned(),
            message,
        },
        StatusCode::NOT_FOUND => resource_id.map_or(ProviderError::Permanent(message), |id| {
            ProviderError::NotFound { id: id.to_owned() }
        }),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::Validation(message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::Transient(message)
        }
        other if other.is_server_error() => ProviderError::Transient(message),
        _ => ProviderError::Permanent(message),
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(err.to_string())
    } else {
        ProviderError::Permanent(err.to_string())
    }
}
