//! HTTP client for the remote Auth API and raw resource requests.

use std::time::Duration;

use reqwest::{header, Client, Method, Response};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use crate::models::TokenPair;

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Base URL used when nothing else is configured
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

const LOGIN_PATH: &str = "/api/v1/auth/login";
const REFRESH_PATH: &str = "/api/v1/auth/refreshToken";

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    email: &'a str,
    token: &'a str,
}

/// Method, headers and JSON body of a resource request.
///
/// Kept as data rather than a built `reqwest::Request` so the session can
/// replay it after a token refresh.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: header::HeaderMap,
    pub body: Option<JsonValue>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: header::HeaderName, value: header::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Client for the Auth API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthApi {
    client: Client,
    base_url: Url,
}

impl AuthApi {
    /// Create a client for `base_url`. No request timeout is applied unless given.
    pub fn new(base_url: Url, timeout: Option<Duration>) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}{path}`, tolerating a trailing slash on the base and a missing
    /// leading slash on the path.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// `{base}/oauth2/authorization/{provider}`
    pub fn authorization_url(&self, provider: &str) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["oauth2", "authorization", provider]);
        Ok(url)
    }

    /// Exchange email and password for a token pair
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        debug!(email, "Sending login request");
        self.post_for_tokens(LOGIN_PATH, &LoginRequest { email, password })
            .await
    }

    /// Exchange a refresh token for a new token pair
    pub async fn refresh(&self, email: &str, refresh_token: &str) -> Result<TokenPair, ApiError> {
        debug!(email, "Sending token refresh request");
        self.post_for_tokens(
            REFRESH_PATH,
            &RefreshRequest {
                email,
                token: refresh_token,
            },
        )
        .await
    }

    /// Issue a resource request with a bearer token. The response is returned
    /// whatever its status.
    pub async fn send(
        &self,
        path: &str,
        options: &RequestOptions,
        access_token: &str,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut headers = options.headers.clone();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.remove(header::AUTHORIZATION);

        let mut request = self
            .client
            .request(options.method.clone(), &url)
            .headers(headers)
            .bearer_auth(access_token);
        if let Some(ref body) = options.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        debug!(method = %options.method, url = %url, status = %response.status(), "Resource request completed");
        Ok(response)
    }

    async fn post_for_tokens<B: Serialize>(&self, path: &str, body: &B) -> Result<TokenPair, ApiError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        let response = Self::check_response(response).await?;

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token response: {}", e)))
    }

    /// Check if response is successful, returning an error with body if not.
    pub async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}
