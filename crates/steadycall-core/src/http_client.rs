use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::failure::{CallError, ErrorKind};

/// Minimal HTTP method set needed by providers and mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Authentication strategy applied to outgoing HTTP requests.
#[derive(Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
    Header { name: String, value: String },
}

impl HttpAuth {
    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None => {}
            Self::BearerToken(token) => {
                headers.insert(String::from("authorization"), format!("Bearer {token}"));
            }
            Self::Header { name, value } => {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
    }
}

// Credentials never reach logs.
impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::BearerToken(_) => f.write_str("BearerToken(<redacted>)"),
            Self::Header { name, .. } => write!(f, "Header {{ name: {name:?}, value: <redacted> }}"),
        }
    }
}

/// File part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpBody {
    Text(String),
    Multipart {
        fields: Vec<(String, String)>,
        file: FilePart,
    },
}

/// HTTP request envelope used by transport calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<HttpBody>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(HttpBody::Text(body.into()));
        self
    }

    pub fn with_multipart(mut self, fields: Vec<(String, String)>, file: FilePart) -> Self {
        self.body = Some(HttpBody::Multipart { fields, file });
        self
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Translates a non-success status into the shared failure taxonomy.
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        let kind = match self.status {
            200..=299 => return None,
            408 | 504 | 524 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::Unauthorized,
            404 | 410 => ErrorKind::NotFound,
            451 => ErrorKind::ContentRejected,
            400..=499 => ErrorKind::InvalidInput,
            500..=599 => ErrorKind::Overloaded,
            _ => ErrorKind::Internal,
        };
        Some(kind)
    }
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    message: String,
    kind: ErrorKind,
}

impl HttpError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Timeout,
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Network,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Internal,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

impl From<HttpError> for CallError {
    fn from(error: HttpError) -> Self {
        CallError::new(error.kind, error.message)
    }
}

/// Transport contract that supports async execution and auth-aware requests.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Production HTTP client backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("steadycall/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            };

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            builder = builder.timeout(request.timeout);

            match request.body {
                Some(HttpBody::Text(body)) => builder = builder.body(body),
                Some(HttpBody::Multipart { fields, file }) => {
                    let part = reqwest::multipart::Part::bytes(file.bytes)
                        .file_name(file.file_name)
                        .mime_str(&file.mime_type)
                        .map_err(|e| HttpError::non_retryable(format!("invalid mime type: {e}")))?;
                    let form = fields
                        .into_iter()
                        .fold(reqwest::multipart::Form::new(), |form, (name, value)| {
                            form.text(name, value)
                        })
                        .part(file.field, part);
                    builder = builder.multipart(form);
                }
                None => {}
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    HttpError::timeout(format!("request timeout: {e}"))
                } else if e.is_connect() || e.is_request() {
                    HttpError::connect(format!("connection failed: {e}"))
                } else if e.is_builder() {
                    HttpError::non_retryable(format!("invalid request: {e}"))
                } else {
                    HttpError::connect(format!("request failed: {e}"))
                }
            })?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| HttpError::connect(format!("failed to read response body: {e}")))?;

            Ok(HttpResponse { status, body })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_auth_populates_authorization_header() {
        let request = HttpRequest::post("https://example.test/v1/transcribe")
            .with_auth(&HttpAuth::BearerToken(String::from("token-123")));

        assert_eq!(
            request.headers.get("authorization").map(String::as_str),
            Some("Bearer token-123")
        );
    }

    #[test]
    fn custom_header_auth_preserves_name_and_value() {
        let request = HttpRequest::get("https://example.test/v1").with_auth(&HttpAuth::Header {
            name: String::from("X-Goog-Api-Key"),
            value: String::from("demo"),
        });

        assert_eq!(
            request.headers.get("x-goog-api-key").map(String::as_str),
            Some("demo")
        );
    }

    #[test]
    fn debug_output_redacts_credentials() {
        let rendered = format!("{:?}", HttpAuth::BearerToken(String::from("sk-secret")));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn status_codes_map_onto_the_failure_taxonomy() {
        let kind = |status| HttpResponse::new(status, "").error_kind();

        assert_eq!(kind(200), None);
        assert_eq!(kind(204), None);
        assert_eq!(kind(429), Some(ErrorKind::RateLimited));
        assert_eq!(kind(503), Some(ErrorKind::Overloaded));
        assert_eq!(kind(529), Some(ErrorKind::Overloaded));
        assert_eq!(kind(504), Some(ErrorKind::Timeout));
        assert_eq!(kind(401), Some(ErrorKind::Unauthorized));
        assert_eq!(kind(404), Some(ErrorKind::NotFound));
        assert_eq!(kind(451), Some(ErrorKind::ContentRejected));
        assert_eq!(kind(422), Some(ErrorKind::InvalidInput));
    }

    #[test]
    fn transport_errors_convert_to_transient_call_errors() {
        let error: CallError = HttpError::timeout("request timeout").into();
        assert!(error.is_transient());

        let error: CallError = HttpError::non_retryable("bad url").into();
        assert!(!error.is_transient());
    }
}
