//! Infrastructure assistant behind the ingest API's `/chat` endpoint.
//!
//! Builds a prompt from the peer worker's metrics snapshot and the user's
//! question, then asks a text-generation service for a completion.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long to wait for the peer worker's `/metrics`.
const PEER_METRICS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("no text generator configured")]
    Unconfigured,

    #[error("text generation request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("text generation failed: {0}")]
    Generation(String),
}

/// Text-generation collaborator: prompt in, completion out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AssistantError>;
}

/// Generator reached over HTTP.
///
/// POSTs `{"prompt": ...}` and reads `completion` (or `text`) from the
/// JSON response.
#[derive(Debug, Clone)]
pub struct HttpTextGenerator {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(alias = "text")]
    completion: String,
}

impl HttpTextGenerator {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    #[tracing::instrument(skip(self, prompt), fields(endpoint = %self.endpoint))]
    async fn generate(&self, prompt: &str) -> Result<String, AssistantError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssistantError::Generation(format!(
                "generator responded with {status}"
            )));
        }

        let completion: Completion = response.json().await?;
        Ok(completion.completion)
    }
}

pub struct Assistant {
    generator: Option<Arc<dyn TextGenerator>>,
    peer_metrics_url: Option<String>,
    client: reqwest::Client,
}

impl Assistant {
    pub fn new(
        generator: Option<Arc<dyn TextGenerator>>,
        peer_metrics_url: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            generator,
            peer_metrics_url,
            client,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.generator.is_some()
    }

    /// Answer a question about the pipeline's current state.
    pub async fn answer(&self, question: &str) -> Result<String, AssistantError> {
        let generator = self.generator.as_ref().ok_or(AssistantError::Unconfigured)?;
        let context = self.peer_context().await;
        generator.generate(&build_prompt(&context, question)).await
    }

    async fn peer_context(&self) -> String {
        let Some(url) = self.peer_metrics_url.as_deref() else {
            return "Worker Service: metrics endpoint not configured".to_string();
        };

        match self.fetch_peer_metrics(url).await {
            Ok(metrics) => format!(
                "Worker Service Status:\n\
                 - Total messages processed: {}\n\
                 - Total errors: {}\n\
                 - Last message time: {}\n\
                 - Service status: {}",
                field(&metrics, "total_processed"),
                field(&metrics, "total_errors"),
                field(&metrics, "last_message_time"),
                field(&metrics, "status"),
            ),
            Err(e) => {
                tracing::warn!(url, error = %e, "Failed to fetch worker metrics");
                format!("Worker Service: Unable to fetch metrics ({e})")
            }
        }
    }

    async fn fetch_peer_metrics(&self, url: &str) -> Result<Value, reqwest::Error> {
        self.client
            .get(url)
            .timeout(PEER_METRICS_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

fn field(metrics: &Value, name: &str) -> String {
    match metrics.get(name) {
        None | Some(Value::Null) => "N/A".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Prompt sent to the text generator.
pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "You are an assistant for an event ingestion pipeline. \
         You help users understand and monitor it by answering questions \
         based on real-time data.\n\n\
         Current Pipeline State:\n{context}\n\n\
         User Question: {question}\n\n\
         Please provide a helpful, concise answer based on the data above. \
         If you don't have enough information, say so clearly."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::health;
    use crate::observability::MetricsRegister;
    use axum::{routing::post, Json, Router};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingGenerator {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerator for CapturingGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, AssistantError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok("all good".into())
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_unconfigured_assistant() {
        let assistant = Assistant::new(None, None, reqwest::Client::new());
        assert!(!assistant.is_configured());
        assert!(matches!(
            assistant.answer("how are things?").await,
            Err(AssistantError::Unconfigured)
        ));
    }

    #[tokio::test]
    async fn test_prompt_includes_peer_metrics() {
        let register = Arc::new(MetricsRegister::new());
        register.record_processed(1_700_000_000_000);
        register.record_error();
        let base = serve(health::create_router(register)).await;

        let generator = Arc::new(CapturingGenerator::default());
        let assistant = Assistant::new(
            Some(generator.clone()),
            Some(format!("{base}/metrics")),
            reqwest::Client::new(),
        );

        let answer = assistant.answer("How many errors?").await.unwrap();
        assert_eq!(answer, "all good");

        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("Total messages processed: 1"));
        assert!(prompts[0].contains("Total errors: 1"));
        assert!(prompts[0].contains("Service status: running"));
        assert!(prompts[0].contains("User Question: How many errors?"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported_in_prompt() {
        let generator = Arc::new(CapturingGenerator::default());
        let assistant = Assistant::new(
            Some(generator.clone()),
            Some("http://127.0.0.1:1/metrics".into()),
            reqwest::Client::new(),
        );

        assistant.answer("status?").await.unwrap();
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("Unable to fetch metrics"));
    }

    #[tokio::test]
    async fn test_http_generator_reads_completion() {
        let router = Router::new().route(
            "/generate",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "text": format!("echo: {}", body["prompt"].as_str().unwrap_or("")) }))
            }),
        );
        let base = serve(router).await;

        let generator = HttpTextGenerator::new(reqwest::Client::new(), format!("{base}/generate"));
        assert_eq!(generator.generate("ping").await.unwrap(), "echo: ping");
    }

    #[tokio::test]
    async fn test_http_generator_error_status() {
        let router = Router::new().route(
            "/generate",
            post(|| async { axum::http::StatusCode::BAD_GATEWAY }),
        );
        let base = serve(router).await;

        let generator = HttpTextGenerator::new(reqwest::Client::new(), format!("{base}/generate"));
        assert!(matches!(
            generator.generate("ping").await,
            Err(AssistantError::Generation(_))
        ));
    }
}
