//! OpenAI-compatible chat completions backend.
//!
//! Sends `POST {api_base}/chat/completions` with `"stream": true` and decodes
//! the server-sent-event body: every `data:` line carries a JSON chunk whose
//! `choices[0].delta.content` is the next fragment, and `data: [DONE]` ends
//! the stream. Works against OpenAI, Ollama (`/v1`), vLLM and similar servers.

use super::{LlmBackend, TextStream};
use crate::server::{
    config::LlmConfig,
    prompt::{ChatMessage, Prompt},
};
use bytes::Bytes;
use core::time::Duration;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tutor_stream_core::{Error, Result};

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

impl OpenAiBackend {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed (TLS backend errors).
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base),
            model: config.model_name.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

impl LlmBackend for OpenAiBackend {
    fn stream(&self, prompt: Prompt) -> TextStream {
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: &prompt,
                stream: true,
            });

        let response = async move {
            let resp = request
                .send()
                .await
                .map_err(|e| Error::generation(format!("LLM request failed: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Error::generation(format!(
                    "LLM endpoint returned {status}: {body}"
                )));
            }
            Ok(resp)
        };

        stream::once(response)
            .map_ok(|resp| decode_event_stream(resp.bytes_stream()))
            .try_flatten()
            .boxed()
    }
}

/// Decodes a server-sent-event body into text fragments.
fn decode_event_stream<S>(body: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = (body.boxed(), SseDecoder::default(), VecDeque::new());

    stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (body, decoder, pending)));
            }
            if decoder.done {
                return None;
            }
            match body.next().await {
                Some(Ok(bytes)) => pending.extend(decoder.push(&bytes)),
                Some(Err(e)) => {
                    decoder.done = true;
                    let err = Error::generation(format!("LLM stream interrupted: {e}"));
                    return Some((Err(err), (body, decoder, pending)));
                }
                None => {
                    pending.extend(decoder.finish());
                    decoder.done = true;
                }
            }
        }
    })
}

/// Line-oriented SSE decoder. Buffers partial lines across body chunks.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<String>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while !self.done {
            let Some(pos) = self.buf.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            out.extend(self.decode_line(&line));
        }
        out
    }

    fn finish(&mut self) -> Vec<Result<String>> {
        if self.done || self.buf.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buf);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<Result<String>> {
        let line = match core::str::from_utf8(line) {
            Ok(line) => line.trim_end_matches(['\r', '\n']),
            Err(e) => return Some(Err(Error::generation(format!("invalid UTF-8 in stream: {e}")))),
        };

        // Comments, `event:`/`id:` fields and blank separators carry no text.
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return None;
        }

        match serde_json::from_str::<ChunkBody>(data) {
            Ok(ChunkBody {
                error: Some(err), ..
            }) => {
                self.done = true;
                Some(Err(Error::generation(err.message)))
            }
            Ok(body) => body
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
                .map(Ok),
            Err(e) => Some(Err(Error::generation(format!(
                "malformed stream chunk: {e}"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::history::Role;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        )
    }

    fn backend_for(server: &MockServer) -> OpenAiBackend {
        OpenAiBackend::new(&LlmConfig {
            model_name: "test-model".into(),
            api_base: format!("{}/v1", server.uri()),
            api_key: "secret".into(),
        })
        .unwrap()
    }

    fn prompt() -> Prompt {
        vec![ChatMessage::new(Role::User, "hello")]
    }

    #[test]
    fn decoder_handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        let body = format!("{}{}data: [DONE]\n\n", chunk("Hel"), chunk("lo"));
        let (a, b) = body.as_bytes().split_at(17);

        let mut out = decoder.push(a);
        out.extend(decoder.push(b));
        let texts: Vec<_> = out.into_iter().map(Result::unwrap).collect();
        assert_eq!(texts, ["Hel", "lo"]);
        assert!(decoder.done);
    }

    #[test]
    fn decoder_skips_role_only_and_comment_lines() {
        let mut decoder = SseDecoder::default();
        let body = ": keep-alive\n\
                    data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n";
        let texts: Vec<_> = decoder
            .push(body.as_bytes())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(texts, ["Hi"]);
    }

    #[test]
    fn decoder_reports_api_errors() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b"data: {\"error\":{\"message\":\"rate limited\"}}\n");
        assert_eq!(out, vec![Err(Error::generation("rate limited"))]);
        assert!(decoder.done);
    }

    #[tokio::test]
    async fn streams_fragments_from_the_endpoint() {
        let server = MockServer::start().await;
        let body = format!("{}{}{}data: [DONE]\n\n", chunk("Hel"), chunk("lo"), chunk("!"));

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "stream": true,
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let fragments: Vec<_> = backend_for(&server).stream(prompt()).collect().await;
        let fragments: Vec<_> = fragments.into_iter().map(Result::unwrap).collect();
        assert_eq!(fragments, ["Hel", "lo", "!"]);
    }

    #[tokio::test]
    async fn http_errors_become_generation_failures() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let items: Vec<_> = backend_for(&server).stream(prompt()).collect().await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(Error::GenerationFailure { message }) => {
                assert!(message.contains("503"), "{message}");
                assert!(message.contains("model loading"), "{message}");
            }
            other => panic!("expected generation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_is_a_generation_failure() {
        let backend = OpenAiBackend::new(&LlmConfig {
            model_name: "m".into(),
            api_base: "http://127.0.0.1:9/v1".into(),
            api_key: "k".into(),
        })
        .unwrap();

        let items: Vec<_> = backend.stream(prompt()).collect().await;
        assert!(matches!(
            items.as_slice(),
            [Err(Error::GenerationFailure { .. })]
        ));
    }
}
