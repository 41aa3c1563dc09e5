//! Resolves a playable audio stream by walking two families of public mirrors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::deadline::Deadline;
use crate::failure::{CallError, ErrorKind};
use crate::http_client::{HttpClient, HttpRequest};
use crate::ValidationError;

/// Response shape spoken by a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFamily {
    /// Piped-style `/streams/{id}` with `audioStreams`.
    Piped,
    /// Invidious-style `/api/v1/videos/{id}` with `adaptiveFormats`.
    Invidious,
}

impl ApiFamily {
    fn lookup_url(self, base: &str, resource_id: &str) -> String {
        let id = urlencoding::encode(resource_id);
        match self {
            Self::Piped => format!("{base}/streams/{id}"),
            Self::Invidious => format!("{base}/api/v1/videos/{id}"),
        }
    }

    fn parse_candidates(self, mirror: &Mirror, body: &str) -> Result<Vec<StreamCandidate>, serde_json::Error> {
        match self {
            Self::Piped => {
                let response: PipedStreams = serde_json::from_str(body)?;
                Ok(response
                    .audio_streams
                    .into_iter()
                    .filter(|stream| !stream.url.is_empty())
                    .map(|stream| StreamCandidate {
                        mirror_url: mirror.url.clone(),
                        api_family: self,
                        resolved_stream_url: stream.url,
                        title: response.title.clone(),
                        duration_seconds: response.duration,
                        bitrate: stream.bitrate.value(),
                        mime_type: stream.mime_type,
                    })
                    .collect())
            }
            Self::Invidious => {
                let response: InvidiousVideo = serde_json::from_str(body)?;
                Ok(response
                    .adaptive_formats
                    .into_iter()
                    .filter(|format| !format.url.is_empty() && format.kind.starts_with("audio/"))
                    .map(|format| StreamCandidate {
                        mirror_url: mirror.url.clone(),
                        api_family: self,
                        resolved_stream_url: format.url,
                        title: response.title.clone(),
                        duration_seconds: response.length_seconds,
                        bitrate: format.bitrate.value(),
                        mime_type: format
                            .kind
                            .split(';')
                            .next()
                            .unwrap_or_default()
                            .trim()
                            .to_owned(),
                    })
                    .collect())
            }
        }
    }
}

/// One independently operated API instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mirror {
    pub url: String,
    pub family: ApiFamily,
}

impl Mirror {
    pub fn new(url: impl AsRef<str>, family: ApiFamily) -> Result<Self, ValidationError> {
        let url = url.as_ref().trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(ValidationError::EmptyMirrorUrl);
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ValidationError::InvalidMirrorUrl {
                value: url.to_owned(),
            });
        }
        Ok(Self {
            url: url.to_owned(),
            family,
        })
    }
}

/// A usable stream found on a mirror.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamCandidate {
    pub mirror_url: String,
    pub api_family: ApiFamily,
    pub resolved_stream_url: String,
    pub title: String,
    pub duration_seconds: u64,
    pub bitrate: u64,
    pub mime_type: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidResource(#[from] ValidationError),

    #[error("no mirror returned a playable stream for '{resource_id}' (tried: {})", mirrors_tried.join(", "))]
    NotFound {
        resource_id: String,
        mirrors_tried: Vec<String>,
    },

    #[error("stream resolution interrupted: {reason}")]
    Interrupted {
        reason: String,
        mirrors_tried: Vec<String>,
    },
}

impl ResolveError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidResource(_) => "resolver.invalid_resource",
            Self::NotFound { .. } => "resolver.not_found",
            Self::Interrupted { .. } => "resolver.interrupted",
        }
    }
}

/// Walks the Piped mirrors, then the Invidious mirrors, once each.
///
/// There is no retry and no breaker here: a failing mirror simply hands over
/// to the next one.
pub struct StreamResolver {
    http: Arc<dyn HttpClient>,
    piped: Vec<Mirror>,
    invidious: Vec<Mirror>,
    request_timeout: Duration,
}

impl StreamResolver {
    pub fn new(http: Arc<dyn HttpClient>, piped: Vec<Mirror>, invidious: Vec<Mirror>) -> Self {
        Self {
            http,
            piped,
            invidious,
            request_timeout: Duration::from_secs(8),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn mirrors(&self) -> impl Iterator<Item = &Mirror> {
        self.piped.iter().chain(self.invidious.iter())
    }

    pub async fn resolve(
        &self,
        resource_id: &str,
        deadline: &Deadline,
    ) -> Result<StreamCandidate, ResolveError> {
        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(ValidationError::EmptyResourceId.into());
        }

        let mut mirrors_tried = Vec::new();

        for (family, mirrors) in [
            (ApiFamily::Piped, &self.piped),
            (ApiFamily::Invidious, &self.invidious),
        ] {
            for mirror in mirrors {
                if let Err(error) = deadline.check() {
                    return Err(ResolveError::Interrupted {
                        reason: error.message().to_owned(),
                        mirrors_tried,
                    });
                }
                mirrors_tried.push(mirror.url.clone());

                match self.query(mirror, resource_id, deadline).await {
                    Ok(candidates) => {
                        if let Some(best) = best_candidate(candidates) {
                            info!(
                                mirror = %mirror.url,
                                family = ?mirror.family,
                                bitrate = best.bitrate,
                                "stream resolved"
                            );
                            return Ok(best);
                        }
                        debug!(mirror = %mirror.url, "mirror returned no usable audio streams");
                    }
                    Err(error) if error.kind() == ErrorKind::Cancelled => {
                        return Err(ResolveError::Interrupted {
                            reason: error.message().to_owned(),
                            mirrors_tried,
                        });
                    }
                    Err(error) => {
                        debug!(mirror = %mirror.url, error = %error, "mirror unavailable");
                    }
                }
            }
            info!(family = ?family, "mirror family exhausted");
        }

        warn!(resource_id, tried = mirrors_tried.len(), "no mirror could resolve the stream");
        Err(ResolveError::NotFound {
            resource_id: resource_id.to_owned(),
            mirrors_tried,
        })
    }

    async fn query(
        &self,
        mirror: &Mirror,
        resource_id: &str,
        deadline: &Deadline,
    ) -> Result<Vec<StreamCandidate>, CallError> {
        let request = HttpRequest::get(mirror.family.lookup_url(&mirror.url, resource_id))
            .with_header("accept", "application/json")
            .with_timeout(self.request_timeout);

        let response = deadline
            .run(async { self.http.execute(request).await.map_err(CallError::from) })
            .await?;

        if let Some(kind) = response.error_kind() {
            return Err(CallError::new(kind, format!("mirror returned status {}", response.status)));
        }

        mirror
            .family
            .parse_candidates(mirror, &response.body)
            .map_err(|e| CallError::internal(format!("unparsable mirror response: {e}")))
    }
}

/// Highest bitrate wins; the earliest entry wins ties.
fn best_candidate(candidates: Vec<StreamCandidate>) -> Option<StreamCandidate> {
    candidates.into_iter().reduce(|best, candidate| {
        if candidate.bitrate > best.bitrate {
            candidate
        } else {
            best
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStreams {
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    audio_streams: Vec<PipedAudioStream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedAudioStream {
    #[serde(default)]
    url: String,
    #[serde(default)]
    bitrate: Bitrate,
    #[serde(default)]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousVideo {
    #[serde(default)]
    title: String,
    #[serde(default)]
    length_seconds: u64,
    #[serde(default)]
    adaptive_formats: Vec<InvidiousFormat>,
}

#[derive(Debug, Deserialize)]
struct InvidiousFormat {
    #[serde(default)]
    url: String,
    #[serde(default)]
    bitrate: Bitrate,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Invidious reports bitrates as strings, Piped as numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Bitrate {
    Number(u64),
    Text(String),
}

impl Default for Bitrate {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl Bitrate {
    fn value(&self) -> u64 {
        match self {
            Self::Number(value) => *value,
            Self::Text(value) => value.trim().parse().unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{HttpError, HttpResponse};
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RoutedHttpClient {
        routes: HashMap<String, Result<HttpResponse, HttpError>>,
        seen: Mutex<Vec<String>>,
    }

    impl RoutedHttpClient {
        fn route(mut self, url: &str, reply: Result<HttpResponse, HttpError>) -> Self {
            self.routes.insert(url.to_owned(), reply);
            self
        }
    }

    impl HttpClient for RoutedHttpClient {
        fn execute<'a>(
            &'a self,
            request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().expect("lock").push(request.url.clone());
                self.routes
                    .get(&request.url)
                    .cloned()
                    .unwrap_or_else(|| Err(HttpError::connect("connection refused")))
            })
        }
    }

    fn mirror(url: &str, family: ApiFamily) -> Mirror {
        Mirror::new(url, family).expect("valid mirror")
    }

    #[test]
    fn mirror_urls_are_normalized_and_validated() {
        assert_eq!(mirror("https://piped.test/", ApiFamily::Piped).url, "https://piped.test");
        assert_eq!(Mirror::new(" ", ApiFamily::Piped), Err(ValidationError::EmptyMirrorUrl));
        assert!(matches!(
            Mirror::new("ftp://piped.test", ApiFamily::Piped),
            Err(ValidationError::InvalidMirrorUrl { .. })
        ));
    }

    #[test]
    fn invidious_parser_keeps_only_audio_formats_with_urls() {
        let body = r#"{
            "title": "Talk",
            "lengthSeconds": 61,
            "adaptiveFormats": [
                {"url": "https://cdn.test/v", "bitrate": "900000", "type": "video/mp4; codecs=\"avc1\""},
                {"url": "", "bitrate": "500000", "type": "audio/webm; codecs=\"opus\""},
                {"url": "https://cdn.test/a", "bitrate": "130000", "type": "audio/mp4; codecs=\"mp4a.40.2\""}
            ]
        }"#;
        let source = mirror("https://inv.test", ApiFamily::Invidious);

        let candidates = ApiFamily::Invidious
            .parse_candidates(&source, body)
            .expect("valid json");

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].bitrate, 130_000);
        assert_eq!(candidates[0].mime_type, "audio/mp4");
        assert_eq!(candidates[0].duration_seconds, 61);
    }

    #[tokio::test]
    async fn falls_back_to_second_family_and_picks_highest_bitrate() {
        let http = RoutedHttpClient::default()
            .route(
                "https://piped-a.test/streams/abc",
                Ok(HttpResponse::ok_json(r#"{"title":"t","duration":10,"audioStreams":[]}"#)),
            )
            .route("https://piped-b.test/streams/abc", Ok(HttpResponse::new(502, "bad gateway")))
            .route("https://inv-a.test/api/v1/videos/abc", Ok(HttpResponse::ok_json("<html>")))
            .route(
                "https://inv-b.test/api/v1/videos/abc",
                Ok(HttpResponse::ok_json(
                    r#"{"title":"Song","lengthSeconds":200,"adaptiveFormats":[
                        {"url":"https://cdn.test/128","bitrate":"128","type":"audio/webm"},
                        {"url":"https://cdn.test/256","bitrate":"256","type":"audio/webm"}
                    ]}"#,
                )),
            );
        let http = Arc::new(http);
        let resolver = StreamResolver::new(
            http.clone(),
            vec![
                mirror("https://piped-a.test", ApiFamily::Piped),
                mirror("https://piped-b.test", ApiFamily::Piped),
            ],
            vec![
                mirror("https://inv-a.test", ApiFamily::Invidious),
                mirror("https://inv-b.test", ApiFamily::Invidious),
                mirror("https://inv-c.test", ApiFamily::Invidious),
            ],
        );

        let candidate = resolver
            .resolve("abc", &Deadline::none())
            .await
            .expect("second invidious mirror answers");

        assert_eq!(candidate.bitrate, 256);
        assert_eq!(candidate.resolved_stream_url, "https://cdn.test/256");
        assert_eq!(candidate.api_family, ApiFamily::Invidious);
        assert_eq!(candidate.mirror_url, "https://inv-b.test");
        assert_eq!(http.seen.lock().expect("lock").len(), 4, "inv-c is never queried");
    }

    #[tokio::test]
    async fn reports_every_mirror_tried_when_nothing_resolves() {
        let resolver = StreamResolver::new(
            Arc::new(RoutedHttpClient::default()),
            vec![mirror("https://piped-a.test", ApiFamily::Piped)],
            vec![mirror("https://inv-a.test", ApiFamily::Invidious)],
        );

        let error = resolver
            .resolve("abc", &Deadline::none())
            .await
            .expect_err("all mirrors refuse connections");

        assert_eq!(
            error,
            ResolveError::NotFound {
                resource_id: String::from("abc"),
                mirrors_tried: vec![
                    String::from("https://piped-a.test"),
                    String::from("https://inv-a.test"),
                ],
            }
        );
    }

    #[tokio::test]
    async fn resource_ids_are_percent_encoded() {
        let http = Arc::new(RoutedHttpClient::default());
        let resolver = StreamResolver::new(
            http.clone(),
            vec![mirror("https://piped-a.test", ApiFamily::Piped)],
            Vec::new(),
        );

        let _ = resolver.resolve("a b/c", &Deadline::none()).await;

        assert_eq!(
            http.seen.lock().expect("lock").as_slice(),
            ["https://piped-a.test/streams/a%20b%2Fc"]
        );
    }

    #[tokio::test]
    async fn empty_resource_id_is_rejected_before_any_request() {
        let http = Arc::new(RoutedHttpClient::default());
        let resolver = StreamResolver::new(http.clone(), vec![mirror("https://p.test", ApiFamily::Piped)], Vec::new());

        let error = resolver.resolve("  ", &Deadline::none()).await.expect_err("empty id");

        assert_eq!(error, ResolveError::InvalidResource(ValidationError::EmptyResourceId));
        assert!(http.seen.lock().expect("lock").is_empty());
    }
}
