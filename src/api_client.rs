use std::time::Duration;

use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;

/// JSON client bound to one management API base URL.
///
/// Response field names are matched case-insensitively: object keys are
/// lower-cased before deserialization, so target types declare lower-case
/// names.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|_| ApiError::InvalidUrl(base_url.clone()))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            credentials: None,
        })
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn build_url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ApiError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|_| ApiError::InvalidUrl(raw.clone()))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        self.send(Method::GET, path, query, None::<&()>).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B, query: &[(&str, &str)]) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, query, Some(body)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B, query: &[(&str, &str)]) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::PUT, path, query, Some(body)).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B, query: &[(&str, &str)]) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::PATCH, path, query, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        self.send(Method::DELETE, path, query, None::<&()>).await
    }

    async fn send<B, T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(path, query)?;
        let url_str = url.to_string();

        let mut request = self.http.request(method, url);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| classify(e, &url_str))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| classify(e, &url_str))?;

        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        decode(&text)
    }
}

fn classify(err: reqwest::Error, url: &str) -> ApiError {
    if err.is_connect() {
        ApiError::Connection {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else if err.is_timeout() {
        ApiError::Timeout { url: url.to_string() }
    } else {
        ApiError::Request(err)
    }
}

/// Deserialize a response body with case-insensitive field names.
/// An empty body decodes as JSON `null`.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    let source = if body.trim().is_empty() { "null" } else { body };
    let value: Value = serde_json::from_str(source).map_err(|e| ApiError::Deserialize {
        source: e,
        body: body.to_string(),
    })?;
    serde_json::from_value(lowercase_keys(value)).map_err(|e| ApiError::Deserialize {
        source: e,
        body: body.to_string(),
    })
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}
