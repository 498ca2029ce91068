use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use stepwise_compaction::{
    CONTINUE_PROMPT, SUMMARY_INSTRUCTION, estimate_tokens_for_chars, render_history, render_since,
    select_tool_outputs_to_prune, summarize, summary_request, usage_tokens, would_overflow,
};
use stepwise_events::{EventJournal, StoreError};
use stepwise_policy::{HookPipeline, RulePermissionGate};
use stepwise_protocol::{
    ErrorPhase, EventKind, EventRecord, HookPayload, ModelOutput, ModelProvider, ModelRequest,
    PermissionGate, PermissionRequest, ProviderError, QuestionAnswerer, RUNTIME_VERSION, SeqNo,
    SessionId, StopReason, StreamEvent, ToolCall, ToolContext, ToolError, ToolErrorKind, Usage,
};
use stepwise_tools::{ToolDispatcher, ToolRegistry};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

use crate::config::RuntimeConfig;

/// One prompt against a new or existing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Resume this session, or create it when it does not exist yet.
    pub session_id: Option<SessionId>,
    pub prompt: String,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            session_id: None,
            prompt: prompt.into(),
        }
    }

    pub fn resume(session_id: SessionId, prompt: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id),
            prompt: prompt.into(),
        }
    }
}

/// Mirror of the terminal `Result` event.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub session_id: SessionId,
    pub stop_reason: StopReason,
    pub final_text: String,
    pub steps: u32,
    pub usage: Option<Usage>,
    pub response_id: Option<String>,
    pub threading_disabled: bool,
    /// `seq` of the terminal `Result` event.
    pub result_seq: SeqNo,
}

#[derive(Debug, Error)]
pub enum QueryError {
    /// Cancelled through the token. Nothing was synthesized for the
    /// interrupted operation.
    #[error("query cancelled")]
    Cancelled,
    /// The session log could not record the query or its failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a query stopped before reaching a terminal decision.
enum Interrupt {
    Cancelled,
    Provider(ProviderError),
    Store(StoreError),
}

impl From<StoreError> for Interrupt {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

enum Step {
    Continue,
    Finished(StopReason),
}

/// Reply-threading state for one query.
#[derive(Debug, Default)]
struct Threading {
    supported: bool,
    disabled: bool,
    response_id: Option<String>,
    /// Last `seq` the provider has seen through `response_id`.
    anchor: SeqNo,
}

impl Threading {
    /// Pick up the id of the previous query's `Result`, anchored at the
    /// assistant message that carried it, unless a later query was
    /// interrupted after talking to the provider.
    fn recover(events: &[EventRecord], supported: bool) -> Self {
        let mut threading = Self {
            supported,
            disabled: events.iter().any(|event| {
                matches!(
                    event.kind,
                    EventKind::Result {
                        threading_disabled: true,
                        ..
                    }
                )
            }),
            ..Self::default()
        };
        let Some(last) = events
            .iter()
            .rposition(|event| matches!(event.kind, EventKind::Result { .. }))
        else {
            return threading;
        };
        let interrupted = events[last..].iter().any(|event| {
            matches!(
                event.kind,
                EventKind::AssistantMessage { .. } | EventKind::ToolUse { .. }
            )
        });
        let EventKind::Result {
            response_id: Some(response_id),
            ..
        } = &events[last].kind
        else {
            return threading;
        };
        if interrupted {
            return threading;
        }
        // The provider saw everything up to the assistant message carrying
        // this id. Tool results logged after it still have to be sent. A tool
        // step without text leaves no such message, so that query replays the
        // full history instead.
        let anchor = events[..last].iter().rev().find_map(|event| match &event.kind {
            EventKind::AssistantMessage {
                response_id: Some(id),
                ..
            } if id == response_id => Some(event.seq),
            _ => None,
        });
        if let Some(anchor) = anchor {
            threading.response_id = Some(response_id.clone());
            threading.anchor = anchor;
        }
        threading
    }

    fn previous(&self) -> Option<(&str, SeqNo)> {
        if !self.supported || self.disabled {
            return None;
        }
        self.response_id.as_deref().map(|id| (id, self.anchor))
    }

    fn record(&mut self, response_id: Option<String>, anchor: SeqNo) {
        self.response_id = response_id;
        self.anchor = anchor;
    }

    fn reset(&mut self) {
        self.response_id = None;
    }
}

/// Mutable state of one query.
struct Turn {
    session_id: SessionId,
    ctx: ToolContext,
    threading: Threading,
    steps: u32,
    usage: Option<Usage>,
    last_text: String,
}

impl Turn {
    fn add_usage(&mut self, usage: Option<&Usage>) {
        if let Some(usage) = usage {
            self.usage
                .get_or_insert_with(Usage::default)
                .accumulate(usage);
        }
    }
}

/// Drives queries against a session log. Holds only shared collaborators,
/// so one value can serve many concurrent sessions.
#[derive(Clone)]
pub struct AgentLoop {
    journal: EventJournal,
    provider: Arc<dyn ModelProvider>,
    dispatcher: ToolDispatcher,
    hooks: Arc<HookPipeline>,
    gate: Arc<dyn PermissionGate>,
    answerer: Option<Arc<dyn QuestionAnswerer>>,
    config: Arc<RuntimeConfig>,
}

pub struct AgentLoopBuilder {
    journal: EventJournal,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    hooks: HookPipeline,
    gate: Option<Arc<dyn PermissionGate>>,
    answerer: Option<Arc<dyn QuestionAnswerer>>,
    config: RuntimeConfig,
}

impl AgentLoopBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn hooks(mut self, hooks: HookPipeline) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn permission_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn answerer(mut self, answerer: Arc<dyn QuestionAnswerer>) -> Self {
        self.answerer = Some(answerer);
        self
    }

    pub fn build(self) -> AgentLoop {
        let dispatcher =
            ToolDispatcher::new(self.tools).with_allowed(self.config.allowed_tools.clone());
        AgentLoop {
            journal: self.journal,
            provider: self.provider,
            dispatcher,
            hooks: Arc::new(self.hooks),
            gate: self
                .gate
                .unwrap_or_else(|| Arc::new(RulePermissionGate::default())),
            answerer: self.answerer,
            config: Arc::new(self.config),
        }
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "allow"
    )
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl AgentLoop {
    pub fn builder(journal: EventJournal, provider: Arc<dyn ModelProvider>) -> AgentLoopBuilder {
        AgentLoopBuilder {
            journal,
            provider,
            tools: Arc::new(ToolRegistry::default()),
            hooks: HookPipeline::new(),
            gate: None,
            answerer: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run one query to its terminal `Result`.
    ///
    /// Provider and session failures are logged as `RuntimeError` followed
    /// by `Result{stop_reason: error}` and returned as an outcome.
    /// Cancellation returns [`QueryError::Cancelled`] without writing
    /// anything further.
    #[instrument(
        skip_all,
        fields(resume = request.session_id.is_some(), session_id = tracing::field::Empty)
    )]
    pub async fn run(
        &self,
        request: QueryRequest,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let (session_id, events) = self.open_session(request.session_id).await?;
        Span::current().record("session_id", tracing::field::display(&session_id));

        let mut turn = Turn {
            ctx: ToolContext::new(session_id.clone(), self.config.cwd.clone()),
            threading: Threading::recover(&events, self.provider.capabilities().reply_threading),
            session_id,
            steps: 0,
            usage: None,
            last_text: String::new(),
        };

        match self.drive(&mut turn, request.prompt, &cancel).await {
            Ok(stop_reason) => self.finish(&turn, stop_reason).await,
            Err(Interrupt::Cancelled) => {
                info!(steps = turn.steps, "query cancelled");
                Err(QueryError::Cancelled)
            }
            Err(Interrupt::Provider(err)) => {
                warn!(error = %err, "query failed in provider phase");
                self.fail(&turn, ErrorPhase::Provider, err.kind(), err.to_string())
                    .await
            }
            Err(Interrupt::Store(err)) => {
                warn!(error = %err, "query failed in session phase");
                self.fail(&turn, ErrorPhase::Session, "store", err.to_string())
                    .await
            }
        }
    }

    async fn open_session(
        &self,
        requested: Option<SessionId>,
    ) -> Result<(SessionId, Vec<EventRecord>), StoreError> {
        let session_id = match requested {
            Some(session_id) if self.journal.session_exists(&session_id).await? => {
                let events = self.journal.read_events(&session_id).await?;
                if !events.is_empty() {
                    info!(
                        session_id = %session_id,
                        events = events.len(),
                        "resuming session"
                    );
                    return Ok((session_id, events));
                }
                session_id
            }
            Some(session_id) => {
                self.journal.create_session_with_id(&session_id).await?;
                session_id
            }
            None => self.journal.create_session().await?,
        };

        let init = self
            .journal
            .append_and_publish(
                &session_id,
                EventKind::SystemInit {
                    session_id: session_id.clone(),
                    cwd: self.config.cwd.display().to_string(),
                    runtime_version: RUNTIME_VERSION.to_owned(),
                },
            )
            .await?;
        info!(session_id = %session_id, "session created");
        Ok((session_id, vec![init]))
    }

    async fn drive(
        &self,
        turn: &mut Turn,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<StopReason, Interrupt> {
        let run = self
            .hooks
            .run(HookPayload::UserPromptSubmit {
                prompt: prompt.clone(),
            })
            .await;
        self.record_hooks(&turn.session_id, run.events).await?;
        if let Some(reason) = run.blocked {
            info!(%reason, "prompt blocked by hook");
            turn.last_text = reason;
            return Ok(StopReason::HookBlocked);
        }
        let prompt = match run.payload {
            HookPayload::UserPromptSubmit { prompt } => prompt,
            _ => prompt,
        };

        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::UserMessage {
                    text: prompt,
                    synthetic: false,
                },
            )
            .await?;

        while turn.steps < self.config.max_steps {
            if cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            turn.steps += 1;
            match self.step(turn, cancel).await? {
                Step::Continue => {}
                Step::Finished(stop_reason) => return Ok(stop_reason),
            }
        }
        info!(max_steps = self.config.max_steps, "step budget exhausted");
        Ok(StopReason::MaxSteps)
    }

    fn build_request(&self, events: &[EventRecord], threading: &Threading) -> ModelRequest {
        let (items, previous) = match threading.previous() {
            Some((response_id, anchor)) => {
                (render_since(events, anchor), Some(response_id.to_owned()))
            }
            None => (render_history(events), None),
        };
        let mut request = ModelRequest::new(self.config.model.clone(), items);
        request.instructions = self.config.instructions.clone();
        request.tools = self.dispatcher.schemas();
        request.api_key = self.config.api_key.clone();
        request.previous_response_id = previous;
        request.max_output_tokens = self.config.max_output_tokens;
        request
    }

    #[instrument(skip_all, fields(step = turn.steps))]
    async fn step(&self, turn: &mut Turn, cancel: &CancellationToken) -> Result<Step, Interrupt> {
        let events = self.journal.read_events(&turn.session_id).await?;
        let request = self.build_request(&events, &turn.threading);

        let run = self
            .hooks
            .run(HookPayload::BeforeModelCall {
                request: request.clone(),
            })
            .await;
        self.record_hooks(&turn.session_id, run.events).await?;
        if let Some(reason) = run.blocked {
            info!(%reason, "model call blocked by hook");
            turn.last_text = reason;
            return Ok(Step::Finished(StopReason::HookBlocked));
        }
        let mut request = match run.payload {
            HookPayload::BeforeModelCall { request } => request,
            _ => request,
        };
        let request_chars = request.char_len();

        let output = match self
            .call_model(&turn.session_id, request.clone(), cancel)
            .await
        {
            Err(Interrupt::Provider(err))
                if request.previous_response_id.is_some() && err.rejects_reply_threading() =>
            {
                warn!(error = %err, "provider rejected reply threading, resending full history");
                turn.threading.disabled = true;
                request.previous_response_id = None;
                request.items = render_history(&events);
                self.call_model(&turn.session_id, request, cancel).await?
            }
            other => other?,
        };
        turn.add_usage(output.usage.as_ref());

        let run = self
            .hooks
            .run(HookPayload::AfterModelCall {
                output: output.clone(),
            })
            .await;
        self.record_hooks(&turn.session_id, run.events).await?;
        if let Some(reason) = run.blocked {
            info!(%reason, "model output blocked by hook");
            turn.last_text = reason;
            return Ok(Step::Finished(StopReason::HookBlocked));
        }
        let output = match run.payload {
            HookPayload::AfterModelCall { output } => output,
            _ => output,
        };

        let text = output.text_or_empty().to_owned();
        if !text.is_empty() {
            turn.last_text = text.clone();
        }

        if output.has_tool_calls() {
            if !text.is_empty() {
                self.journal
                    .append_and_publish(
                        &turn.session_id,
                        EventKind::AssistantMessage {
                            text,
                            is_summary: false,
                            response_id: output.response_id.clone(),
                        },
                    )
                    .await?;
            }
            let anchor = self.journal.latest_sequence(&turn.session_id).await?;
            turn.threading.record(output.response_id.clone(), anchor);

            debug!(count = output.tool_calls.len(), "executing tool calls");
            for (index, call) in output.tool_calls.into_iter().enumerate() {
                self.run_tool_call(turn, index, call, cancel).await?;
            }
            self.prune_tool_outputs(&turn.session_id).await?;
            return Ok(Step::Continue);
        }

        let record = self
            .journal
            .append_and_publish(
                &turn.session_id,
                EventKind::AssistantMessage {
                    text: text.clone(),
                    is_summary: false,
                    response_id: output.response_id.clone(),
                },
            )
            .await?;
        turn.threading.record(output.response_id.clone(), record.seq);

        let tokens = output
            .usage
            .as_ref()
            .map(usage_tokens)
            .unwrap_or_else(|| estimate_tokens_for_chars(request_chars + text.chars().count()));
        if self.should_compact(tokens) && self.compact(turn, tokens, cancel).await? {
            return Ok(Step::Continue);
        }
        Ok(Step::Finished(StopReason::End))
    }

    fn should_compact(&self, tokens: u64) -> bool {
        self.config.compaction.auto
            && self.provider.capabilities().auto_compaction
            && would_overflow(&self.config.compaction, tokens)
    }

    /// Summarize the history and open a new pivot. Returns `false` when a
    /// hook blocked the compaction.
    #[instrument(skip_all, fields(usage_tokens = tokens))]
    async fn compact(
        &self,
        turn: &mut Turn,
        tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<bool, Interrupt> {
        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::UserCompaction {
                    auto: true,
                    usage_tokens: tokens,
                },
            )
            .await?;

        let run = self
            .hooks
            .run(HookPayload::SessionCompacting {
                instruction: SUMMARY_INSTRUCTION.to_owned(),
            })
            .await;
        self.record_hooks(&turn.session_id, run.events).await?;
        if let Some(reason) = run.blocked {
            info!(%reason, "compaction blocked by hook");
            return Ok(false);
        }
        let instruction = match run.payload {
            HookPayload::SessionCompacting { instruction } => instruction,
            _ => SUMMARY_INSTRUCTION.to_owned(),
        };

        let events = self.journal.read_events(&turn.session_id).await?;
        let mut request = summary_request(&self.config.model, &render_history(&events), &instruction);
        request.api_key = self.config.api_key.clone();
        request.max_output_tokens = self.config.max_output_tokens;

        let provider = self.provider.as_ref();
        let summary = self
            .with_retry(cancel, || summarize(provider, request.clone()))
            .await?;
        turn.add_usage(summary.usage.as_ref());

        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::AssistantMessage {
                    text: summary.text,
                    is_summary: true,
                    response_id: None,
                },
            )
            .await?;
        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::UserMessage {
                    text: CONTINUE_PROMPT.to_owned(),
                    synthetic: true,
                },
            )
            .await?;
        turn.threading.reset();
        info!("session compacted");
        Ok(true)
    }

    async fn call_model(
        &self,
        session_id: &SessionId,
        request: ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelOutput, Interrupt> {
        self.with_retry(cancel, || self.call_once(session_id, request.clone()))
            .await
    }

    async fn call_once(
        &self,
        session_id: &SessionId,
        request: ModelRequest,
    ) -> Result<ModelOutput, ProviderError> {
        if !(self.config.stream && self.provider.capabilities().streaming) {
            return self.provider.complete(request).await;
        }
        let mut stream = self.provider.stream(request).await?;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::TextDelta(text) => self.journal.publish_delta(session_id, text),
                StreamEvent::Completed(output) => return Ok(output),
                StreamEvent::Failed(message) => return Err(ProviderError::stream(message)),
                StreamEvent::Aborted(err) => return Err(err),
            }
        }
        Err(ProviderError::stream("stream ended without a completed response"))
    }

    /// Retry rate limits per the configured policy. Cancellation interrupts
    /// both the call and the backoff sleep.
    async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, Interrupt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let policy = self.config.retry;
        let mut attempt = 0_u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                result = call() => result,
            };
            match result {
                Err(ProviderError::RateLimit { retry_after }) if attempt < policy.max_retries => {
                    let delay = policy.delay_for(attempt, retry_after);
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "provider rate limited, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other.map_err(Interrupt::Provider),
            }
        }
    }

    #[instrument(skip_all, fields(tool = %call.name, tool_use_id = %call.id))]
    async fn run_tool_call(
        &self,
        turn: &mut Turn,
        index: usize,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupt> {
        let ToolCall {
            id,
            name,
            arguments,
        } = call;
        let tool_use_id = if id.trim().is_empty() {
            format!("call_{}_{index}", turn.steps)
        } else {
            id
        };

        let run = self
            .hooks
            .run(HookPayload::PreToolUse {
                tool_use_id: tool_use_id.clone(),
                tool_name: name.clone(),
                input: arguments.clone(),
            })
            .await;
        self.record_hooks(&turn.session_id, run.events).await?;
        let input = match run.payload {
            HookPayload::PreToolUse { input, .. } => input,
            _ => arguments,
        };

        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::ToolUse {
                    tool_use_id: tool_use_id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
            )
            .await?;

        if let Some(reason) = run.blocked {
            let err = ToolError::new(ToolErrorKind::HookBlocked, reason);
            return self.record_tool_error(&turn.session_id, tool_use_id, err).await;
        }
        let tool = match self.dispatcher.resolve(&name) {
            Ok(tool) => tool,
            Err(err) => return self.record_tool_error(&turn.session_id, tool_use_id, err).await,
        };
        let input = match self
            .authorize(turn, &tool_use_id, &name, input, cancel)
            .await?
        {
            Ok(input) => input,
            Err(err) => return self.record_tool_error(&turn.session_id, tool_use_id, err).await,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            result = self.dispatcher.execute(tool.as_ref(), input, &turn.ctx) => result,
        };
        let (output, error) = match result {
            Ok(output) => (output, None),
            Err(err) => (Value::String(err.message.clone()), Some(err)),
        };

        let run = self
            .hooks
            .run(HookPayload::PostToolUse {
                tool_use_id: tool_use_id.clone(),
                tool_name: name,
                output: output.clone(),
                is_error: error.is_some(),
            })
            .await;
        self.record_hooks(&turn.session_id, run.events).await?;
        let (output, error) = match (run.blocked, run.payload) {
            (Some(reason), _) => (
                Value::String(reason.clone()),
                Some(ToolError::new(ToolErrorKind::HookBlocked, reason)),
            ),
            (
                None,
                HookPayload::PostToolUse {
                    output: rewritten,
                    is_error,
                    ..
                },
            ) => {
                let error = match (is_error, error) {
                    (false, _) => None,
                    (true, Some(err)) => Some(err),
                    (true, None) => Some(ToolError::execution(value_text(&rewritten))),
                };
                (rewritten, error)
            }
            (None, _) => (output, error),
        };
        self.record_tool_result(&turn.session_id, tool_use_id, output, error)
            .await
    }

    /// Ask the permission gate, and the answerer if the gate has a question.
    /// The inner `Err` is a denial to be logged as the tool's result.
    async fn authorize(
        &self,
        turn: &Turn,
        tool_use_id: &str,
        tool_name: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Result<Value, ToolError>, Interrupt> {
        let decision = self
            .gate
            .approve(&PermissionRequest {
                session_id: turn.session_id.clone(),
                tool_use_id: tool_use_id.to_owned(),
                tool_name: tool_name.to_owned(),
                input: input.clone(),
                cwd: self.config.cwd.clone(),
            })
            .await;
        if decision.allowed {
            return Ok(Ok(decision.updated_input.unwrap_or(input)));
        }

        let denied = |message: String| ToolError::new(ToolErrorKind::PermissionDenied, message);
        let Some(question) = decision.question else {
            let message = decision
                .deny_message
                .unwrap_or_else(|| format!("permission gate denied tool {tool_name}"));
            return Ok(Err(denied(message)));
        };

        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::UserQuestion {
                    tool_use_id: tool_use_id.to_owned(),
                    question: question.clone(),
                },
            )
            .await?;
        let Some(answerer) = &self.answerer else {
            return Ok(Err(denied(format!(
                "permission for tool {tool_name} requires an answer but no question answerer is configured"
            ))));
        };

        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            answer = answerer.ask(tool_use_id, &question) => answer,
        };
        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::UserAnswer {
                    tool_use_id: tool_use_id.to_owned(),
                    answer: answer.clone(),
                },
            )
            .await?;

        Ok(match answer {
            Some(answer) if is_affirmative(&answer) => {
                Ok(decision.updated_input.unwrap_or(input))
            }
            Some(answer) => Err(denied(format!(
                "{} declined tool {tool_name}: {}",
                answerer.name(),
                answer.trim()
            ))),
            None => Err(denied(format!(
                "{} gave no answer for tool {tool_name}",
                answerer.name()
            ))),
        })
    }

    async fn record_tool_error(
        &self,
        session_id: &SessionId,
        tool_use_id: String,
        err: ToolError,
    ) -> Result<(), Interrupt> {
        let output = Value::String(err.message.clone());
        self.record_tool_result(session_id, tool_use_id, output, Some(err))
            .await
    }

    async fn record_tool_result(
        &self,
        session_id: &SessionId,
        tool_use_id: String,
        output: Value,
        error: Option<ToolError>,
    ) -> Result<(), Interrupt> {
        if let Some(err) = &error {
            debug!(error_kind = err.kind.as_str(), "tool call failed");
        }
        self.journal
            .append_and_publish(
                session_id,
                EventKind::ToolResult {
                    tool_use_id,
                    output,
                    is_error: error.is_some(),
                    error_kind: error.as_ref().map(|err| err.kind),
                    error_message: error.map(|err| err.message),
                },
            )
            .await?;
        Ok(())
    }

    async fn prune_tool_outputs(&self, session_id: &SessionId) -> Result<(), StoreError> {
        if !self.config.compaction.prune {
            return Ok(());
        }
        let events = self.journal.read_events(session_id).await?;
        let selected = select_tool_outputs_to_prune(&events, &self.config.compaction);
        for tool_use_id in selected {
            self.journal
                .append_and_publish(session_id, EventKind::ToolOutputCompacted { tool_use_id })
                .await?;
        }
        Ok(())
    }

    async fn record_hooks(
        &self,
        session_id: &SessionId,
        events: Vec<EventKind>,
    ) -> Result<(), StoreError> {
        for kind in events {
            self.journal.append_and_publish(session_id, kind).await?;
        }
        Ok(())
    }

    async fn fail(
        &self,
        turn: &Turn,
        phase: ErrorPhase,
        error_kind: &str,
        message: String,
    ) -> Result<QueryOutcome, QueryError> {
        self.journal
            .append_and_publish(
                &turn.session_id,
                EventKind::RuntimeError {
                    phase,
                    error_kind: error_kind.to_owned(),
                    message,
                },
            )
            .await?;
        self.finish(turn, StopReason::Error).await
    }

    async fn finish(&self, turn: &Turn, stop_reason: StopReason) -> Result<QueryOutcome, QueryError> {
        let record = self
            .journal
            .append_and_publish(
                &turn.session_id,
                EventKind::Result {
                    final_text: turn.last_text.clone(),
                    session_id: turn.session_id.clone(),
                    stop_reason,
                    steps: turn.steps,
                    usage: turn.usage,
                    response_id: turn.threading.response_id.clone(),
                    threading_disabled: turn.threading.disabled,
                },
            )
            .await?;
        info!(
            stop_reason = stop_reason.as_str(),
            steps = turn.steps,
            seq = record.seq,
            "query finished"
        );
        Ok(QueryOutcome {
            session_id: turn.session_id.clone(),
            stop_reason,
            final_text: turn.last_text.clone(),
            steps: turn.steps,
            usage: turn.usage,
            response_id: turn.threading.response_id.clone(),
            threading_disabled: turn.threading.disabled,
            result_seq: record.seq,
        })
    }
}
