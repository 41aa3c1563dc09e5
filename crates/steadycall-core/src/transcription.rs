//! Speech-to-text over OpenAI-compatible `audio/transcriptions` endpoints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::BreakerRegistry;
use crate::config::{ProviderEntry, Settings};
use crate::failure::CallError;
use crate::http_client::{FilePart, HttpAuth, HttpClient, HttpRequest};
use crate::orchestrator::{CallFuture, Invoker, OperationProvider, OperationRequest, ProviderOrchestrator};
use crate::{CoreError, ProviderId};

/// Audio payload for one transcription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AudioClip {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_type_for(&file_name).to_owned();
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }

    pub async fn read(path: &Path) -> Result<Self, CoreError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| CoreError::FileRead {
                path: path.display().to_string(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("audio"));
        Ok(Self::new(file_name, bytes))
    }
}

fn mime_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "ogg" | "oga" => "audio/ogg",
        "webm" => "audio/webm",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Text returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// One HTTP transcription provider.
pub struct HttpTranscriber {
    id: ProviderId,
    endpoint: String,
    model: String,
    auth: HttpAuth,
    http: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl HttpTranscriber {
    pub fn new(entry: &ProviderEntry, http: Arc<dyn HttpClient>, timeout: Duration) -> Self {
        Self {
            id: entry.id().clone(),
            endpoint: entry.endpoint.clone(),
            model: entry.model.clone(),
            auth: entry.auth(),
            http,
            timeout,
        }
    }

    async fn transcribe(&self, request: &OperationRequest<AudioClip>) -> Result<Transcript, CallError> {
        let clip = request.payload();
        if clip.bytes.is_empty() {
            return Err(CallError::invalid_input("audio file is empty"));
        }

        let mut fields = vec![
            (String::from("model"), self.model.clone()),
            (String::from("response_format"), String::from("json")),
        ];
        if let Some(language) = request.language() {
            fields.push((String::from("language"), language.to_owned()));
        }

        let http_request = HttpRequest::post(&self.endpoint)
            .with_auth(&self.auth)
            .with_header("x-request-id", request.id().to_string())
            .with_timeout(self.timeout)
            .with_multipart(
                fields,
                FilePart {
                    field: String::from("file"),
                    file_name: clip.file_name.clone(),
                    mime_type: clip.mime_type.clone(),
                    bytes: clip.bytes.clone(),
                },
            );

        let response = self.http.execute(http_request).await?;
        if let Some(kind) = response.error_kind() {
            return Err(CallError::new(
                kind,
                format!("{} returned status {}: {}", self.id, response.status, snippet(&response.body)),
            ));
        }

        let transcript = serde_json::from_str::<Transcript>(&response.body)
            .map_err(|e| CallError::internal(format!("{} returned an unreadable transcript: {e}", self.id)))?;
        if transcript.text.trim().is_empty() {
            return Err(CallError::internal(format!("{} returned an empty transcript", self.id)));
        }
        Ok(transcript)
    }
}

impl OperationProvider<AudioClip, Transcript> for HttpTranscriber {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn call<'a>(&'a self, request: &'a OperationRequest<AudioClip>) -> CallFuture<'a, Transcript> {
        Box::pin(self.transcribe(request))
    }
}

/// Wires every catalog entry to an [`HttpTranscriber`] behind one orchestrator.
pub fn transcription_invoker(
    settings: &Settings,
    http: Arc<dyn HttpClient>,
    breakers: Arc<BreakerRegistry>,
) -> Invoker<AudioClip, Transcript> {
    let orchestrator = ProviderOrchestrator::new(settings.catalog.configs(), breakers)
        .with_inter_provider_pause(settings.inter_provider_pause);
    let implementations = settings
        .catalog
        .entries()
        .iter()
        .map(|entry| {
            Arc::new(HttpTranscriber::new(entry, http.clone(), settings.request_timeout))
                as Arc<dyn OperationProvider<AudioClip, Transcript>>
        })
        .collect();
    Invoker::new(orchestrator, implementations)
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((index, _)) => format!("{}...", &trimmed[..index]),
        None => trimmed.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use crate::failure::ErrorKind;
    use crate::http_client::{HttpBody, HttpError, HttpResponse};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    struct RecordingHttp {
        reply: HttpResponse,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl HttpClient for RecordingHttp {
        fn execute<'a>(
            &'a self,
            request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            Box::pin(async move {
                self.requests.lock().expect("lock").push(request);
                Ok(self.reply.clone())
            })
        }
    }

    fn transcriber(reply: HttpResponse) -> (HttpTranscriber, Arc<RecordingHttp>) {
        let settings = Settings::from_json(None, |name| {
            (name == "OPENAI_API_KEY").then(|| String::from("sk-test"))
        })
        .expect("defaults");
        let entry = settings
            .catalog
            .get(&ProviderId::parse("openai").expect("id"))
            .expect("openai entry")
            .clone();
        let http = Arc::new(RecordingHttp {
            reply,
            requests: Mutex::new(Vec::new()),
        });
        (HttpTranscriber::new(&entry, http.clone(), Duration::from_secs(30)), http)
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(AudioClip::new("memo.M4A", vec![1]).mime_type, "audio/mp4");
        assert_eq!(AudioClip::new("noext", vec![1]).mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn sends_multipart_upload_with_language_and_credentials() {
        let (transcriber, http) = transcriber(HttpResponse::ok_json(r#"{"text":"hola"}"#));
        let request = OperationRequest::new(AudioClip::new("clip.wav", vec![0, 1, 2])).with_language("es");

        let transcript = transcriber.call(&request).await.expect("transcribed");

        assert_eq!(transcript.text, "hola");
        let requests = http.requests.lock().expect("lock");
        let sent = &requests[0];
        assert_eq!(sent.url, "https://api.openai.com/v1/audio/transcriptions");
        assert_eq!(sent.headers.get("authorization").map(String::as_str), Some("Bearer sk-test"));
        match &sent.body {
            Some(HttpBody::Multipart { fields, file }) => {
                assert!(fields.contains(&(String::from("language"), String::from("es"))));
                assert!(fields.contains(&(String::from("model"), String::from("whisper-1"))));
                assert_eq!(file.mime_type, "audio/wav");
            }
            other => panic!("expected multipart body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_status_becomes_transient_error() {
        let (transcriber, _) = transcriber(HttpResponse::new(429, r#"{"error":"slow down"}"#));
        let request = OperationRequest::new(AudioClip::new("clip.wav", vec![1]));

        let error = transcriber.call(&request).await.expect_err("429");

        assert_eq!(error.kind(), ErrorKind::RateLimited);
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn empty_audio_is_rejected_without_a_request() {
        let (transcriber, http) = transcriber(HttpResponse::ok_json(r#"{"text":"x"}"#));
        let request = OperationRequest::new(AudioClip::new("clip.wav", Vec::new()));

        let error = transcriber.call(&request).await.expect_err("empty");

        assert_eq!(error.kind(), ErrorKind::InvalidInput);
        assert!(http.requests.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn invoker_only_schedules_enabled_providers() {
        let settings = Settings::from_json(Some(r#"{"inter_provider_pause_ms": 0}"#), |name| {
            (name == "GROQ_API_KEY").then(|| String::from("gsk"))
        })
        .expect("settings");
        let http: Arc<dyn HttpClient> = Arc::new(RecordingHttp {
            reply: HttpResponse::ok_json(r#"{"text":"hello"}"#),
            requests: Mutex::new(Vec::new()),
        });
        let invoker = transcription_invoker(&settings, http, Arc::new(BreakerRegistry::new()));

        let result = invoker
            .invoke(&OperationRequest::new(AudioClip::new("a.mp3", vec![9])), &Deadline::none())
            .await
            .expect("groq answers");

        assert_eq!(result.provider_id.as_str(), "groq");
        assert_eq!(result.payload.text, "hello");
    }
}
