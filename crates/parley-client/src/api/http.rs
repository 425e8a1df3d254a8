//! reqwest-backed [`RestApi`].

use std::{future::Future, time::Duration};

use parley_core::Credentials;
use reqwest::{Client, header::AUTHORIZATION};

use super::{ApiRequest, ApiResponse, Method, RestApi};
use crate::error::ApiError;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for the backend API.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    /// Client rooted at `base_url` (e.g. `https://host/api`).
    ///
    /// # Errors
    ///
    /// - `ApiError::Network` if the TLS backend cannot be initialised
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// - `ApiError::Network` if the TLS backend cannot be initialised
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network { reason: e.to_string() })?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl RestApi for HttpApi {
    fn execute(
        &self,
        credentials: &Credentials,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, ApiError>> + Send {
        let method = match request.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };
        let url = format!("{}{}", self.base_url, request.path());

        let mut builder = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, credentials.bearer())
            .query(&request.query());
        if let Some(body) = request.body() {
            builder = builder.json(&body);
        }
        let request = request.clone();

        async move {
            let response = builder.send().await.map_err(|e| {
                tracing::debug!(path = %request.path(), error = %e, "request failed");
                ApiError::Network { reason: e.to_string() }
            })?;

            let status = response.status().as_u16();
            let body =
                response.text().await.map_err(|e| ApiError::Network { reason: e.to_string() })?;

            tracing::debug!(path = %request.path(), status, "response");
            request.decode(status, &body)
        }
    }
}
