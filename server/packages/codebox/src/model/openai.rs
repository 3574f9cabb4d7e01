use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::sse::SseAccumulator;
use super::{
    ChatMessage, FinishReason, ModelError, ModelEvent, ModelGateway, ModelRequest, ModelStream,
    ToolCallRequest, ToolDefinition,
};

/// Streams chat completions from any OpenAI-compatible endpoint, such as an
/// AI gateway fronting several providers.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleGateway {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatibleGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }
}

#[async_trait]
impl ModelGateway for OpenAiCompatibleGateway {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = request_body(&request);
        debug!(model = %request.model, messages = request.messages.len(), "model turn");
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }
        Ok(decode_stream(response.bytes_stream()))
    }
}

fn request_body(request: &ModelRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_to_openai).collect();
    let mut body = json!({
        "model": request.model,
        "stream": true,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.iter().map(tool_to_openai).collect());
    }
    body
}

fn message_to_openai(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({ "role": "system", "content": content }),
        ChatMessage::User { content } => json!({ "role": "user", "content": content }),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = Map::new();
            value.insert("role".to_string(), json!("assistant"));
            value.insert(
                "content".to_string(),
                content.clone().map(Value::String).unwrap_or(Value::Null),
            );
            if !tool_calls.is_empty() {
                let calls = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.call_id,
                            "type": "function",
                            "function": {
                                "name": call.tool_name,
                                "arguments": call.input.to_string(),
                            }
                        })
                    })
                    .collect();
                value.insert("tool_calls".to_string(), Value::Array(calls));
            }
            Value::Object(value)
        }
        ChatMessage::Tool { call_id, content } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": content,
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds `chat.completion.chunk` payloads into [`ModelEvent`]s. Tool call
/// fragments are joined by index and released together with the finish
/// marker.
#[derive(Debug, Default)]
struct ChunkDecoder {
    tool_calls: BTreeMap<u64, PartialToolCall>,
    pending: VecDeque<ModelEvent>,
    finished: bool,
}

impl ChunkDecoder {
    fn push_data(&mut self, payload: &str) -> Result<(), ModelError> {
        if payload == "[DONE]" {
            self.finish(FinishReason::Stop);
            return Ok(());
        }
        let value: Value =
            serde_json::from_str(payload).map_err(|err| ModelError::Decode(err.to_string()))?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ModelError::Stream(message));
        }
        if self.finished {
            return Ok(());
        }
        let Some(choice) = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return Ok(());
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.pending.push_back(ModelEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for (position, call) in calls.iter().enumerate() {
                    let index = call
                        .get("index")
                        .and_then(Value::as_u64)
                        .unwrap_or(position as u64);
                    let entry = self.tool_calls.entry(index).or_default();
                    if let Some(id) = call.get("id").and_then(Value::as_str) {
                        entry.id = Some(id.to_string());
                    }
                    if let Some(function) = call.get("function") {
                        if let Some(name) = function.get("name").and_then(Value::as_str) {
                            entry.name.push_str(name);
                        }
                        if let Some(arguments) = function.get("arguments").and_then(Value::as_str)
                        {
                            entry.arguments.push_str(arguments);
                        }
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish(FinishReason::parse(reason));
        }
        Ok(())
    }

    fn finish(&mut self, reason: FinishReason) {
        if self.finished {
            return;
        }
        self.finished = true;
        let calls = std::mem::take(&mut self.tool_calls);
        for (index, call) in calls {
            self.pending.push_back(ModelEvent::ToolCall(ToolCallRequest {
                call_id: call.id.unwrap_or_else(|| format!("call_{index}")),
                tool_name: call.name,
                input: parse_arguments(&call.arguments),
            }));
        }
        self.pending.push_back(ModelEvent::Finish { reason });
    }
}

/// Malformed arguments are passed through as a string so the tool's input
/// validation reports them to the model.
fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    accumulator: SseAccumulator,
    decoder: ChunkDecoder,
    done: bool,
}

fn decode_stream<S, B>(bytes: S) -> ModelStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        accumulator: SseAccumulator::new(),
        decoder: ChunkDecoder::default(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.decoder.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for payload in state.accumulator.push(chunk.as_ref()) {
                        if let Err(err) = state.decoder.push_data(&payload) {
                            state.done = true;
                            return Some((Err(err), state));
                        }
                    }
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(ModelError::Http(err)), state));
                }
                None => {
                    state.done = true;
                    if let Some(payload) = state.accumulator.flush() {
                        if let Err(err) = state.decoder.push_data(&payload) {
                            return Some((Err(err), state));
                        }
                    }
                    state.decoder.finish(FinishReason::Stop);
                }
            }
        }
    })
    .boxed()
}
