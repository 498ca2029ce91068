use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use stepwise_protocol::{EventKind, Hook, HookDecision, HookError, HookPayload, HookPoint};
use tracing::{debug, instrument, warn};

use crate::matches;

/// One hook bound to a point, optionally filtered by a target matcher.
#[derive(Clone)]
pub struct HookRegistration {
    pub name: String,
    pub point: HookPoint,
    /// Tested against [`HookPayload::target`]. `None` matches every payload.
    /// At points without a target only `*` matches.
    pub matcher: Option<String>,
    pub hook: Arc<dyn Hook>,
}

impl HookRegistration {
    pub fn new(name: impl Into<String>, point: HookPoint, hook: impl Hook + 'static) -> Self {
        Self {
            name: name.into(),
            point,
            matcher: None,
            hook: Arc::new(hook),
        }
    }

    pub fn with_matcher(mut self, matcher: impl Into<String>) -> Self {
        self.matcher = Some(matcher.into());
        self
    }

    fn applies_to(&self, payload: &HookPayload) -> bool {
        match (self.matcher.as_deref(), payload.target()) {
            (None, _) => true,
            (Some(pattern), Some(target)) => matches(pattern, target),
            (Some(pattern), None) => pattern.split('|').any(|alt| alt.trim() == "*"),
        }
    }
}

impl fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistration")
            .field("name", &self.name)
            .field("point", &self.point)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Result of running every registration for one point.
#[derive(Debug, Clone)]
pub struct HookRun {
    /// The payload after all accepted rewrites.
    pub payload: HookPayload,
    /// Set when a hook blocked; later hooks did not run.
    pub blocked: Option<String>,
    /// `HookEvent`s in invocation order, for the caller to persist.
    pub events: Vec<EventKind>,
}

impl HookRun {
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// Ordered hook registrations, run in registration order.
#[derive(Debug, Clone, Default)]
pub struct HookPipeline {
    registrations: Vec<HookRegistration>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: HookRegistration) {
        self.registrations.push(registration);
    }

    pub fn with(mut self, registration: HookRegistration) -> Self {
        self.register(registration);
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Run the registrations for `payload`'s point.
    ///
    /// A hook that errors or panics is recorded and skipped. A rewrite must
    /// carry a payload for the same point or it is ignored. The first block
    /// stops the pipeline.
    #[instrument(skip_all, fields(point = payload.point().as_str()))]
    pub async fn run(&self, payload: HookPayload) -> HookRun {
        let point = payload.point();
        let mut current = payload;
        let mut blocked = None;
        let mut events = Vec::new();

        for registration in self.registrations.iter().filter(|r| r.point == point) {
            if !registration.applies_to(&current) {
                events.push(EventKind::HookEvent {
                    hook: registration.name.clone(),
                    point,
                    matched: false,
                    duration_ms: 0,
                    decision: None,
                    error: None,
                });
                continue;
            }

            let started = Instant::now();
            let result = AssertUnwindSafe(registration.hook.invoke(&current))
                .catch_unwind()
                .await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let (decision, error) = match result {
                Ok(Ok(HookDecision::Continue)) => (Some("continue"), None),
                Ok(Ok(HookDecision::Rewrite(next))) if next.point() == point => {
                    current = next;
                    (Some("rewrite"), None)
                }
                Ok(Ok(HookDecision::Rewrite(next))) => {
                    warn!(hook = %registration.name, "ignoring rewrite for another hook point");
                    (
                        Some("rewrite"),
                        Some(format!(
                            "rewrite for {} ignored at {}",
                            next.point().as_str(),
                            point.as_str()
                        )),
                    )
                }
                Ok(Ok(HookDecision::Block { reason })) => {
                    let reason = if reason.trim().is_empty() {
                        format!("blocked by hook {}", registration.name)
                    } else {
                        reason
                    };
                    blocked = Some(reason);
                    (Some("block"), None)
                }
                Ok(Err(err)) => {
                    warn!(hook = %registration.name, error = %err, "hook failed");
                    (None, Some(err.to_string()))
                }
                Err(panic) => {
                    let message = format!("hook panicked: {}", panic_message(panic.as_ref()));
                    warn!(hook = %registration.name, "{message}");
                    (None, Some(message))
                }
            };
            debug!(hook = %registration.name, ?decision, duration_ms, "hook invoked");

            events.push(EventKind::HookEvent {
                hook: registration.name.clone(),
                point,
                matched: true,
                duration_ms,
                decision: decision.map(str::to_owned),
                error,
            });
            if blocked.is_some() {
                break;
            }
        }

        HookRun {
            payload: current,
            blocked,
            events,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// A hook backed by a synchronous closure.
pub struct FnHook<F> {
    func: F,
}

impl<F> FnHook<F>
where
    F: Fn(&HookPayload) -> Result<HookDecision, HookError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&HookPayload) -> Result<HookDecision, HookError> + Send + Sync,
{
    async fn invoke(&self, payload: &HookPayload) -> Result<HookDecision, HookError> {
        (self.func)(payload)
    }
}
