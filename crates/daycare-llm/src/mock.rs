//! Mock inference provider for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::provider::*;
use daycare_core::{DaycareError, Message, Result};

/// A mock provider whose clients pop pre-configured responses in order.
///
/// # Example
/// ```
/// use daycare_llm::mock::MockProvider;
/// let provider = MockProvider::new("test")
///     .with_response("Hello, world!");
/// ```
pub struct MockProvider {
    id: String,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    /// Track all requests received (for assertions in tests).
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// If set, `create_client` fails with this reason.
    client_error: Option<String>,
    clients_created: Arc<Mutex<u32>>,
}

/// A pre-configured response from the mock provider.
#[derive(Clone, Default)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<daycare_core::ToolCall>,
    /// If set, the client will return this error instead.
    pub error: Option<String>,
}

/// A request as seen by a mock client.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub context: InferenceContext,
    pub stop: Vec<String>,
}

impl MockResponse {
    /// Create a text response.
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// Create an error response.
    pub fn error(msg: &str) -> Self {
        Self {
            error: Some(msg.to_string()),
            ..Default::default()
        }
    }
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(vec![])),
            client_error: None,
            clients_created: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(MockResponse::text(text));
        self
    }

    /// Queue a completion error.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push_back(MockResponse::error(error));
        self
    }

    /// Make every `create_client` call fail.
    pub fn with_client_error(mut self, reason: &str) -> Self {
        self.client_error = Some(reason.to_string());
        self
    }

    /// Queue a response directly (for shared-handle patterns).
    pub fn queue_response(&self, resp: MockResponse) {
        self.responses.lock().push_back(resp);
    }

    /// Get all requests that were made to this provider's clients.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<RecordedRequest>>> {
        Arc::clone(&self.requests)
    }

    pub fn clients_created(&self) -> u32 {
        *self.clients_created.lock()
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_client(&self, model: &str, _options: &Value) -> Result<Arc<dyn InferenceClient>> {
        *self.clients_created.lock() += 1;
        if let Some(reason) = &self.client_error {
            return Err(DaycareError::ProviderUnavailable {
                provider: self.id.clone(),
                reason: reason.clone(),
            });
        }
        Ok(Arc::new(MockClient {
            provider: self.id.clone(),
            model: model.to_string(),
            responses: Arc::clone(&self.responses),
            requests: Arc::clone(&self.requests),
        }))
    }
}

/// Client handed out by [`MockProvider`]; shares its response queue.
pub struct MockClient {
    provider: String,
    model: String,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[async_trait]
impl InferenceClient for MockClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        context: &InferenceContext,
        options: &CompletionOptions,
    ) -> Result<InferenceResponse> {
        self.requests.lock().push(RecordedRequest {
            model: self.model.clone(),
            context: context.clone(),
            stop: options.stop.clone(),
        });
        let mock = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockResponse::text("(mock: no more queued responses)"));

        if let Some(error) = mock.error {
            return Err(DaycareError::ModelCall {
                provider: self.provider.clone(),
                reason: error,
            });
        }

        let stop_reason = if mock.tool_calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        };
        Ok(InferenceResponse {
            message: Message::assistant(mock.text, mock.tool_calls),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                ..Default::default()
            },
            stop_reason,
        })
    }
}
