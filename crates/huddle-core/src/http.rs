use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::RoomError;
use crate::storage::KeyValueStorage;

/// Storage key of the bearer token written by [`HttpClient::authorize`].
pub const TOKEN_KEY: &str = "access_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Absolute URL, or a path relative to the client's endpoint.
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Sent in addition to the client's platform, version and auth headers.
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, RoomError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// HTTP access used by the engine. Non-2xx responses are returned, not
/// turned into errors; transport failures are.
pub trait HttpClient: Send + Sync {
    /// Exchange an auth query string for an access token.
    fn authorize<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<String, RoomError>>;
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RoomError>>;
    fn send_log_file<'a>(
        &'a self,
        path: &'a Path,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), RoomError>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    access_token: String,
}

/// reqwest-backed client bound to a base endpoint.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    endpoint: url::Url,
    platform: String,
    version: String,
    storage: Option<Arc<dyn KeyValueStorage>>,
}

impl ReqwestHttpClient {
    pub fn new(
        endpoint: &str,
        platform: &str,
        version: &str,
        timeout: Duration,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> Result<Self, RoomError> {
        let mut endpoint = url::Url::parse(endpoint)
            .map_err(|e| RoomError::InvalidArgument(format!("invalid endpoint {endpoint}: {e}")))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            platform: platform.to_string(),
            version: version.to_string(),
            storage,
        })
    }

    /// Resolve `url` against the endpoint and append query pairs.
    pub fn build_url(&self, url: &str, query: &[(String, String)]) -> Result<url::Url, RoomError> {
        let mut resolved = self
            .endpoint
            .join(url)
            .map_err(|e| RoomError::InvalidArgument(format!("invalid url {url}: {e}")))?;
        if !query.is_empty() {
            resolved
                .query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(resolved)
    }

    fn decorate(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header("X-Platform", &self.platform)
            .header("X-App-Version", &self.version)
            .header("X-Request-Id", uuid::Uuid::new_v4().to_string());
        match self.storage.as_ref().and_then(|s| s.get_string(TOKEN_KEY)) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn prepare(&self, request: &HttpRequest) -> Result<reqwest::Request, RoomError> {
        let url = self.build_url(&request.url, &request.query)?;
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(self.decorate(builder).build()?)
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RoomError> {
        let prepared = self.prepare(&request)?;
        tracing::debug!("http {:?} {}", request.method, prepared.url());
        let resp = self.client.execute(prepared).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn authorize<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<String, RoomError>> {
        Box::pin(async move {
            let url = format!("authorize?{}", query.trim_start_matches('?'));
            let resp = self.execute(HttpRequest::get(url)).await?;
            if !resp.is_success() {
                return Err(RoomError::Connection(format!(
                    "authorize returned status {}",
                    resp.status
                )));
            }
            let token = resp.json::<AuthorizeResponse>()?.access_token;
            if let Some(storage) = &self.storage {
                storage.set_string(TOKEN_KEY, &token)?;
            }
            Ok(token)
        })
    }

    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RoomError>> {
        Box::pin(self.execute(request))
    }

    fn send_log_file<'a>(
        &'a self,
        path: &'a Path,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), RoomError>> {
        Box::pin(async move {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("huddle.log")
                .to_string();
            let url = self.build_url(&format!("logs?name={}", urlencoding::encode(&name)), &[])?;
            let part = reqwest::multipart::Part::bytes(body)
                .file_name(name.clone())
                .mime_str("text/plain")?;
            let form = reqwest::multipart::Form::new().part("file", part);
            let resp = self
                .decorate(self.client.post(url))
                .multipart(form)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(RoomError::Http(format!(
                    "log upload of {name} returned status {}",
                    resp.status()
                )));
            }
            tracing::info!("uploaded log file {name}");
            Ok(())
        })
    }
}
