//! External service seams.
//!
//! The pipeline talks to two opaque services: a chat model used for
//! classification and extraction, and an image model used for
//! illustrations. Both are traits so tests and alternative providers can
//! stand in for the bundled OpenAI-compatible client.

use crate::{
    config::Config,
    error::{Error, Result},
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// A single-turn chat request: a system prompt plus user text.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    /// Instructions for the model
    pub system: &'a str,
    /// User content (already truncated by the caller)
    pub user: &'a str,
    /// Upper bound on the reply length
    pub max_tokens: u32,
}

/// Text-in, text-out chat model.
///
/// Implementations must be stateless between calls; the pipeline never
/// retries a failed call within a run.
pub trait ChatModel: Send + Sync {
    /// Sends the request and returns the raw reply text.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or times out.
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String>;
}

/// Prompt-in, image-bytes-out model.
pub trait ImageModel: Send + Sync {
    /// Generates an image for the prompt and returns the encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the payload cannot be decoded.
    fn generate(&self, prompt: &str) -> Result<Vec<u8>>;
}

impl<T: ChatModel + ?Sized> ChatModel for Arc<T> {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String> {
        (**self).complete(request)
    }
}

impl<T: ImageModel + ?Sized> ImageModel for Arc<T> {
    fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
        (**self).generate(prompt)
    }
}

/// Blocking client for an OpenAI-compatible API.
pub struct OpenAiClient {
    http: reqwest::blocking::Client,
    api_base: String,
    api_key: String,
    chat_model: String,
    image_model: String,
    image_size: String,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct ImageBody<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    output_format: &'a str,
    n: u32,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    #[serde(default)]
    b64_json: Option<String>,
}

impl OpenAiClient {
    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.require_api_key()?.to_string();

        let http = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: config.api_base.clone(),
            api_key,
            chat_model: config.chat_model.clone(),
            image_model: config.image_model.clone(),
            image_size: config.image_size.clone(),
        })
    }

    fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        service: &str,
        endpoint: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.api_base, endpoint);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(Error::service(service, format!("HTTP {status}: {text}")));
        }

        response
            .json::<R>()
            .map_err(|e| Error::service(service, format!("unexpected response: {e}")))
    }
}

impl ChatModel for OpenAiClient {
    #[instrument(skip_all, fields(model = %self.chat_model))]
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String> {
        let body = ChatBody {
            model: &self.chat_model,
            max_tokens: request.max_tokens,
            messages: [
                ChatMessage {
                    role: "system",
                    content: request.system,
                },
                ChatMessage {
                    role: "user",
                    content: request.user,
                },
            ],
        };

        let response: ChatResponse = self.post("chat", "chat/completions", &body)?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::service("chat", "response has no message content"))?;

        debug!("Chat reply: {} chars", content.len());
        Ok(content)
    }
}

impl ImageModel for OpenAiClient {
    #[instrument(skip_all, fields(model = %self.image_model))]
    fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
        let body = ImageBody {
            model: &self.image_model,
            prompt,
            size: &self.image_size,
            output_format: "jpeg",
            n: 1,
        };

        let response: ImageResponse = self.post("image", "images/generations", &body)?;
        let encoded = response
            .data
            .into_iter()
            .next()
            .and_then(|data| data.b64_json)
            .ok_or_else(|| Error::service("image", "response has no b64_json payload"))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::service("image", format!("invalid base64 payload: {e}")))?;

        if bytes.is_empty() {
            return Err(Error::service("image", "empty image payload"));
        }

        debug!("Image received: {} bytes", bytes.len());
        Ok(bytes)
    }
}

/// Strips a surrounding Markdown code fence from a model reply.
///
/// Models often wrap JSON in ```` ```json ```` fences even when asked not to.
pub(crate) fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted service doubles shared by the module tests.

    use super::*;
    use std::sync::Mutex;

    /// Chat double that answers by matching the system prompt and user text.
    pub(crate) struct ScriptedChat {
        handler: Box<dyn Fn(&ChatRequest<'_>) -> Result<String> + Send + Sync>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl ScriptedChat {
        pub(crate) fn new(
            handler: impl Fn(&ChatRequest<'_>) -> Result<String> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ChatModel for ScriptedChat {
        fn complete(&self, request: &ChatRequest<'_>) -> Result<String> {
            self.calls.lock().unwrap().push(request.user.to_string());
            (self.handler)(request)
        }
    }

    /// Image double returning fixed bytes, or failing for prompts that
    /// contain a marker.
    pub(crate) struct FixedImage {
        pub(crate) bytes: Vec<u8>,
        pub(crate) fail_marker: Option<String>,
        pub(crate) prompts: Mutex<Vec<String>>,
    }

    impl FixedImage {
        pub(crate) fn new(bytes: &[u8]) -> Self {
            Self {
                bytes: bytes.to_vec(),
                fail_marker: None,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing_on(mut self, marker: &str) -> Self {
            self.fail_marker = Some(marker.to_string());
            self
        }
    }

    impl ImageModel for FixedImage {
        fn generate(&self, prompt: &str) -> Result<Vec<u8>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.fail_marker {
                Some(marker) if prompt.contains(marker.as_str()) => {
                    Err(Error::service("image", "HTTP 500: boom"))
                }
                _ => Ok(self.bytes.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n[1, 2]\n```\n"), "[1, 2]");
        assert_eq!(strip_code_fence("  recipe  "), "recipe");
    }

    #[test]
    fn test_client_requires_api_key() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::builder()
            .root_dir(temp.path())
            .stages(crate::config::Stages::menu_only())
            .build()
            .unwrap();

        let err = OpenAiClient::from_config(&config).err().unwrap();
        assert!(matches!(err, Error::MissingCredential { .. }));
    }

    #[test]
    fn test_chat_body_shape() {
        let body = ChatBody {
            model: "m",
            max_tokens: 150,
            messages: [
                ChatMessage {
                    role: "system",
                    content: "classify",
                },
                ChatMessage {
                    role: "user",
                    content: "soup",
                },
            ],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][1]["content"], "soup");
        assert_eq!(json["max_tokens"], 150);
    }
}
