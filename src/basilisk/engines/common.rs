//! Shared utilities used across provider engine implementations.
//!
//! The helpers in this module are what an additional OpenAI-compatible
//! adapter would build on: a tuned shared [`reqwest`] client, request/response
//! helpers for the chat-completions wire format, and an SSE reader that turns
//! a streaming HTTP response into parsed event payloads.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::time::Duration;

use crate::basilisk::conversation::{Conversation, Message, MessageBlock, SystemMessage};
use crate::basilisk::engine::{CompletionHandle, TextDeltaStream};
use crate::basilisk::error::BasiliskError;
use crate::basilisk::storage::{ImageRequestOptions, RequestSource, StorageRoot};

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client instance keeps TLS sessions and DNS lookups warm,
    /// which significantly reduces latency when several conversations stream
    /// from upstream providers at once.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Host line separator applied to all provider-returned text.
pub const LINE_SEP: &str = if cfg!(windows) { "\r\n" } else { "\n" };

/// Normalise line endings in provider text to the host separator.
pub fn normalize_linesep(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    if LINE_SEP == "\n" {
        unified
    } else {
        unified.replace('\n', LINE_SEP)
    }
}

/// Split a `data:<mime>;base64,<payload>` URL into its MIME type and payload.
pub fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.split(';').next().unwrap_or("").to_string();
    Some((mime, payload.to_string()))
}

/// Incremental reader over a `text/event-stream` response body.
///
/// Buffers raw bytes, surfaces one parsed `data:` payload per call, skips
/// `event:` framing lines, and treats `[DONE]` or EOF as end of stream.
pub struct SseEvents {
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    done: bool,
}

impl SseEvents {
    pub fn new(response: reqwest::Response) -> Self {
        SseEvents {
            stream: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Next `data:` payload, or `None` at end of stream.
    pub async fn next_event(&mut self) -> Result<Option<Value>, BasiliskError> {
        if self.done {
            return Ok(None);
        }
        loop {
            while let Some(at) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=at).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    self.done = true;
                    return Ok(None);
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(value) => return Ok(Some(value)),
                    Err(err) => {
                        return Err(BasiliskError::Content(format!(
                            "malformed stream event: {}",
                            err
                        )))
                    }
                }
            }
            match self.stream.next().await {
                Some(Ok(bytes)) => self.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => return Err(err.into()),
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }
}

/// Adapt an SSE event sequence into a text-delta stream using a per-provider
/// extraction closure (`None` skips an event).
pub fn sse_text_stream<F>(events: SseEvents, extract: F) -> TextDeltaStream
where
    F: FnMut(&Value) -> Option<String> + Send + 'static,
{
    Box::pin(futures_util::stream::unfold(
        (events, extract),
        |(mut events, mut extract)| async move {
            loop {
                match events.next_event().await {
                    Ok(Some(value)) => {
                        if let Some(delta) = extract(&value) {
                            return Some((Ok(delta), (events, extract)));
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => return Some((Err(err), (events, extract))),
                }
            }
        },
    ))
}

/// Surface non-success responses as typed errors: 401/403 become credential
/// errors, everything else a transport error carrying the request URL.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BasiliskError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    if log::log_enabled!(log::Level::Error) {
        log::error!("HTTP {} from {}: {}", status, url, body);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(BasiliskError::Credential(format!("HTTP {}: {}", status, body)))
    } else {
        Err(BasiliskError::Transport {
            message: format!("HTTP {}: {}", status, body),
            url: Some(url),
        })
    }
}

/// POST a JSON body with bearer auth to `{base_url}{path}`.
pub async fn post_bearer_json(
    base_url: &str,
    path: &str,
    api_key: &str,
    organization: Option<&str>,
    body: &Value,
) -> Result<reqwest::Response, BasiliskError> {
    let url = format!("{}{}", base_url.trim_end_matches('/'), path);
    let mut request = get_shared_http_client()
        .post(&url)
        .bearer_auth(api_key)
        .json(body);
    if let Some(organization) = organization {
        request = request.header("OpenAI-Organization", organization);
    }
    let response = request.send().await?;
    check_status(response).await
}

/// Render one conversation message as chat-completions `content`.
///
/// Messages without attachments stay plain strings.  With attachments the
/// content becomes a part array: the text part first, image attachments as
/// `image_url` parts (inlined or passed through per the attachment store),
/// and — when the engine accepts documents — file attachments flattened into
/// labelled text parts.
pub fn message_content(
    message: &Message,
    store: &StorageRoot,
    options: &ImageRequestOptions,
    include_documents: bool,
) -> Result<Value, BasiliskError> {
    if message.attachments.is_empty() {
        return Ok(Value::String(message.content.clone()));
    }
    let mut parts = Vec::new();
    if !message.content.is_empty() {
        parts.push(json!({"type": "text", "text": message.content}));
    }
    for attachment in &message.attachments {
        if attachment.is_image() {
            let source = store.resolve_for_request(attachment, options)?;
            parts.push(json!({
                "type": "image_url",
                "image_url": {"url": source.as_str()},
            }));
        } else if include_documents {
            let source = store.resolve_for_request(attachment, &ImageRequestOptions::default())?;
            let text = match &source {
                RequestSource::Url(url) => url.clone(),
                RequestSource::DataUrl(url) => match split_data_url(url) {
                    Some((_, payload)) => {
                        use base64::Engine as _;
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(payload.as_bytes())
                            .map_err(|err| {
                                BasiliskError::Content(format!("bad attachment payload: {}", err))
                            })?;
                        String::from_utf8_lossy(&bytes).into_owned()
                    }
                    None => url.clone(),
                },
            };
            parts.push(json!({
                "type": "text",
                "text": format!("[{}]\n{}", attachment.name(), text),
            }));
        } else {
            log::warn!(
                "dropping attachment '{}': engine does not accept documents",
                attachment.name()
            );
        }
    }
    Ok(Value::Array(parts))
}

/// Build the chat-completions `messages` array: optional system message,
/// prior blocks in order, then the pending request.
pub fn chat_messages(
    conversation: &Conversation,
    new_block: &MessageBlock,
    system: Option<&SystemMessage>,
    options: &ImageRequestOptions,
    include_documents: bool,
) -> Result<Vec<Value>, BasiliskError> {
    let store = &conversation.storage_root;
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(json!({"role": "system", "content": system.content}));
    }
    for block in &conversation.messages {
        messages.push(json!({
            "role": "user",
            "content": message_content(&block.request, store, options, include_documents)?,
        }));
        if let Some(response) = &block.response {
            messages.push(json!({
                "role": "assistant",
                "content": response.content,
            }));
        }
    }
    messages.push(json!({
        "role": "user",
        "content": message_content(&new_block.request, store, options, include_documents)?,
    }));
    Ok(messages)
}

/// Assemble a chat-completions request body from a prepared message array and
/// the block's sampling parameters.  `None` parameters are omitted.
pub fn chat_payload(model_id: &str, messages: Vec<Value>, block: &MessageBlock, stream: bool) -> Value {
    let mut payload = json!({
        "model": model_id,
        "messages": messages,
        "stream": stream,
    });
    if let Some(temperature) = block.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = block.top_p {
        payload["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = block.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    payload
}

/// Run a chat-completions request against an OpenAI-compatible endpoint and
/// wrap the outcome in a [`CompletionHandle`].
pub async fn chat_completion(
    base_url: &str,
    api_key: &str,
    organization: Option<&str>,
    payload: &Value,
) -> Result<CompletionHandle, BasiliskError> {
    let stream = payload["stream"].as_bool().unwrap_or(false);
    let response =
        post_bearer_json(base_url, "/chat/completions", api_key, organization, payload).await?;
    if stream {
        Ok(CompletionHandle::Stream(sse_text_stream(
            SseEvents::new(response),
            |value| chat_stream_delta(value),
        )))
    } else {
        let value = response.json::<Value>().await?;
        Ok(CompletionHandle::Full(value))
    }
}

/// Content delta carried by one chat-completions stream chunk, if any.
pub fn chat_stream_delta(value: &Value) -> Option<String> {
    value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Final assistant content of a chat-completions payload.
pub fn chat_final_content(value: &Value) -> Option<String> {
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
}

/// Final assistant content of a responses-style payload: `output_text` when
/// present, else the flattened `output[*].content[*].text`.
pub fn responses_final_content(value: &Value) -> Option<String> {
    if let Some(text) = value["output_text"].as_str() {
        return Some(text.to_string());
    }
    let output = value["output"].as_array()?;
    let mut text = String::new();
    for item in output {
        if let Some(parts) = item["content"].as_array() {
            for part in parts {
                if let Some(fragment) = part["text"].as_str() {
                    text.push_str(fragment);
                }
            }
        }
    }
    Some(text)
}

/// Final content tolerant of both chat-style and responses-style payloads.
/// Empty content is permitted; callers seal a zero-length assistant turn.
pub fn final_content(value: &Value) -> String {
    chat_final_content(value)
        .or_else(|| responses_final_content(value))
        .unwrap_or_default()
}

/// Citation annotations attached to a chat-completions response, kept opaque.
pub fn extract_citations(value: &Value) -> Option<Vec<Value>> {
    let annotations = value["choices"][0]["message"]["annotations"].as_array()?;
    if annotations.is_empty() {
        return None;
    }
    Some(annotations.clone())
}
