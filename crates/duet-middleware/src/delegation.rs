use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{MiddlewareResult, ResetReason, TurnContext, TurnMiddleware, WARNING_TAG};

/// What the collaborative stack did with a delegated prompt.
#[derive(Debug, Clone)]
pub enum DelegationOutcome {
    Completed {
        model_used: String,
        output: String,
        fallback: bool,
    },
    Busy {
        retry_after: Duration,
    },
    Failed {
        error: String,
        oom_detected: bool,
    },
}

/// Seam to the collaborative routing stack. `route_prompt` returns `None`
/// when the prompt is not a delegation candidate.
#[async_trait]
pub trait DelegationGateway: Send + Sync {
    fn enabled(&self) -> bool;

    async fn route_prompt(&self, prompt: &str) -> anyhow::Result<Option<DelegationOutcome>>;
}

/// Intercepts delegation-worthy user prompts and runs them through the
/// collaborative stack synchronously, converting the outcome into an
/// injected notice. A failing gateway degrades to a fallback notice rather
/// than aborting the turn.
pub struct DelegationRouting {
    gateway: Arc<dyn DelegationGateway>,
    routed_this_turn: bool,
}

impl DelegationRouting {
    pub fn new(gateway: Arc<dyn DelegationGateway>) -> Self {
        Self {
            gateway,
            routed_this_turn: false,
        }
    }
}

#[async_trait]
impl TurnMiddleware for DelegationRouting {
    fn name(&self) -> &str {
        "delegation_routing"
    }

    async fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if !self.gateway.enabled() {
            return MiddlewareResult::proceed();
        }
        let Some(message) = ctx.latest_user_message() else {
            return MiddlewareResult::proceed();
        };

        match self.gateway.route_prompt(&message.content).await {
            Ok(Some(outcome)) => {
                self.routed_this_turn = true;
                MiddlewareResult::inject(format_outcome(&outcome))
            }
            Ok(None) => MiddlewareResult::proceed(),
            Err(err) => {
                tracing::warn!("collaborative routing failed: {}", err);
                MiddlewareResult::inject(format!(
                    "<{tag}>Collaborative routing error: {}. Falling back to the planner.</{tag}>",
                    err,
                    tag = WARNING_TAG
                ))
            }
        }
    }

    async fn after_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        self.routed_this_turn = false;
        MiddlewareResult::proceed()
    }

    fn reset(&mut self, _reason: ResetReason) {
        self.routed_this_turn = false;
    }
}

fn format_outcome(outcome: &DelegationOutcome) -> String {
    match outcome {
        DelegationOutcome::Completed {
            model_used,
            output,
            fallback,
        } => {
            let via = if *fallback {
                "via planner fallback"
            } else {
                "via collaborative routing"
            };
            format!(
                "<{tag}>Task completed by {} {}</{tag}>\n\n{}",
                model_used,
                via,
                output,
                tag = WARNING_TAG
            )
        }
        DelegationOutcome::Busy { retry_after } => format!(
            "<{tag}>Collaborative system is busy. Please wait {:.1} seconds and try again.</{tag}>",
            retry_after.as_secs_f64(),
            tag = WARNING_TAG
        ),
        DelegationOutcome::Failed {
            error,
            oom_detected,
        } => {
            let kind = if *oom_detected {
                "out of memory"
            } else {
                "error"
            };
            format!(
                "<{tag}>Collaborative routing failed ({}): {}. Falling back to the planner.</{tag}>",
                kind,
                error,
                tag = WARNING_TAG
            )
        }
    }
}
