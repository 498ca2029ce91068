//! reqwest transport and the [`HttpProvider`] adapter.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_protocol::{
    ModelOutput, ModelProvider, ModelRequest, ModelStream, ProviderCapabilities, ProviderError,
    StreamEvent, WireProtocol,
};
use tracing::{debug, instrument, warn};

use crate::{StreamState, build_body, new_decoder, parse_response};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub protocol: WireProtocol,
    /// Defaults per protocol when unset.
    pub base_url: Option<String>,
    /// Used when a request carries no key of its own.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub streaming: bool,
    pub auto_compaction: bool,
    /// Whole-request timeout for non-streaming calls.
    pub timeout_secs: u64,
    /// Longest gap between stream chunks.
    pub stream_idle_secs: u64,
    pub connect_timeout_secs: u64,
    pub anthropic_version: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Responses,
            base_url: None,
            api_key: None,
            streaming: true,
            auto_compaction: true,
            timeout_secs: 120,
            stream_idle_secs: 120,
            connect_timeout_secs: 10,
            anthropic_version: ANTHROPIC_VERSION.to_owned(),
        }
    }
}

impl ProviderConfig {
    pub fn base_url(&self) -> &str {
        match (&self.base_url, self.protocol) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, WireProtocol::AnthropicMessages) => "https://api.anthropic.com/v1",
            (None, _) => "https://api.openai.com/v1",
        }
    }

    pub fn endpoint(&self) -> String {
        let path = match self.protocol {
            WireProtocol::Responses => "responses",
            WireProtocol::ChatCompletions => "chat/completions",
            WireProtocol::AnthropicMessages => "messages",
        };
        format!("{}/{path}", self.base_url())
    }
}

/// Read a rate-limit hint from `retry-after-ms` (milliseconds) or
/// `retry-after` (seconds). HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header_f64 = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0)
    };
    if let Some(ms) = header_f64("retry-after-ms") {
        return Some(Duration::from_secs_f64(ms / 1_000.0));
    }
    header_f64("retry-after").map(Duration::from_secs_f64)
}

fn map_send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport {
            message: err.to_string(),
        }
    }
}

/// A provider speaking one wire protocol over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    name: String,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|err| ProviderError::Transport {
                message: format!("failed to build http client: {err}"),
            })?;
        Ok(Self {
            name: format!("http:{}", config.protocol),
            config,
            client,
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn headers(&self, api_key: Option<&str>) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = api_key.or(self.config.api_key.as_deref());
        let invalid = |err: reqwest::header::InvalidHeaderValue| ProviderError::Transport {
            message: format!("invalid auth header: {err}"),
        };
        match self.config.protocol {
            WireProtocol::AnthropicMessages => {
                if let Some(key) = key {
                    headers.insert("x-api-key", HeaderValue::from_str(key).map_err(invalid)?);
                }
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_str(&self.config.anthropic_version).map_err(invalid)?,
                );
            }
            WireProtocol::Responses | WireProtocol::ChatCompletions => {
                if let Some(key) = key {
                    headers.insert(
                        AUTHORIZATION,
                        HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
                    );
                }
            }
        }
        Ok(headers)
    }

    async fn send(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = build_body(self.config.protocol, request, stream);
        let mut builder = self
            .client
            .post(self.config.endpoint())
            .headers(self.headers(request.api_key.as_deref())?)
            .json(&body);
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.config.timeout_secs));
        }
        let response = builder.send().await.map_err(map_send_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers());
            warn!(?retry_after, "provider rate limited the request");
            return Err(ProviderError::RateLimit { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "provider returned an error status");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: self.config.streaming,
            reply_threading: self.config.protocol == WireProtocol::Responses,
            auto_compaction: self.config.auto_compaction,
        }
    }

    #[instrument(skip_all, fields(protocol = %self.config.protocol, model = %request.model))]
    async fn complete(&self, request: ModelRequest) -> Result<ModelOutput, ProviderError> {
        let response = self.send(&request, false).await?;
        let raw = response.text().await.map_err(map_send_error)?;
        let value: Value =
            serde_json::from_str(&raw).map_err(|_| ProviderError::invalid_response(raw.clone()))?;
        let output = parse_response(self.config.protocol, &value)?;
        debug!(
            tool_calls = output.tool_calls.len(),
            response_id = ?output.response_id,
            "provider call completed"
        );
        Ok(output)
    }

    #[instrument(skip_all, fields(protocol = %self.config.protocol, model = %request.model))]
    async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ProviderError> {
        let response = self.send(&request, true).await?;
        let idle = Duration::from_secs(self.config.stream_idle_secs);
        let state = StreamState::new(new_decoder(self.config.protocol));
        Ok(body_events(response.bytes_stream(), idle, state))
    }
}

/// Decode a response body into stream events. A stall longer than `idle`
/// ends the stream with `Aborted(Timeout)`, a read error with
/// `Aborted(Transport)`.
fn body_events<S, B, E>(body: S, idle: Duration, mut state: StreamState) -> ModelStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let events = async_stream::stream! {
        let mut body = Box::pin(body);
        loop {
            let Ok(next) = tokio::time::timeout(idle, body.next()).await else {
                warn!(idle_secs = idle.as_secs(), "provider stream stalled");
                yield StreamEvent::Aborted(ProviderError::Timeout);
                return;
            };
            match next {
                Some(Ok(chunk)) => {
                    for event in state.push(chunk.as_ref()) {
                        yield event;
                    }
                    if state.is_finished() {
                        return;
                    }
                }
                Some(Err(err)) => {
                    yield StreamEvent::Aborted(ProviderError::Transport {
                        message: format!("stream read error: {err}"),
                    });
                    return;
                }
                None => break,
            }
        }
        for event in state.finish() {
            yield event;
        }
    };
    Box::pin(events)
}
