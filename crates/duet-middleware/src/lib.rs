//! Per-turn policy pipeline for the agent loop.
//!
//! Policies implement [`TurnMiddleware`] and run in registration order before
//! and after every conversational turn. A `Stop` or `Compact` short-circuits
//! immediately; `InjectMessage` results from the before-turn phase accumulate
//! so several policies can contribute text to the same turn. Injecting from
//! the after-turn phase is a programming error and fails loudly.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

mod delegation;
mod policies;

pub use delegation::{DelegationGateway, DelegationOutcome, DelegationRouting};
pub use policies::{
    AutoCompact, LoopDetection, PlanReminder, PriceLimit, TurnLimit, PLAN_MODE_REMINDER,
};

/// Tag wrapped around injected advisory messages so the model can tell them
/// from user text.
pub const WARNING_TAG: &str = "duet_warning";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareAction {
    Continue,
    Stop,
    Compact,
    InjectMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Stop,
    Compact,
}

#[derive(Debug, Clone)]
pub struct MiddlewareResult {
    pub action: MiddlewareAction,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub metadata: Map<String, Value>,
}

impl Default for MiddlewareResult {
    fn default() -> Self {
        Self::proceed()
    }
}

impl MiddlewareResult {
    pub fn proceed() -> Self {
        Self {
            action: MiddlewareAction::Continue,
            message: None,
            reason: None,
            metadata: Map::new(),
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            action: MiddlewareAction::Stop,
            message: None,
            reason: Some(reason.into()),
            metadata: Map::new(),
        }
    }

    pub fn compact(metadata: Map<String, Value>) -> Self {
        Self {
            action: MiddlewareAction::Compact,
            message: None,
            reason: None,
            metadata,
        }
    }

    pub fn inject(message: impl Into<String>) -> Self {
        Self {
            action: MiddlewareAction::InjectMessage,
            message: Some(message.into()),
            reason: None,
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Default,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
}

impl ToolCallRecord {
    /// `name:jsonArgs` — the signature loop detection compares turns by.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.name, self.arguments)
    }
}

#[derive(Debug, Clone)]
pub struct TurnMessage {
    pub role: MessageRole,
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl TurnMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
        }
    }
}

/// Running totals the limits and compaction policies watch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnStats {
    pub turns: u32,
    pub context_tokens: u64,
    pub session_cost: f64,
}

#[derive(Debug, Clone)]
pub struct TurnPolicyConfig {
    pub auto_compact_enabled: bool,
    pub auto_compact_threshold: f64,
    pub context_window: u64,
    pub mode: AgentMode,
}

impl Default for TurnPolicyConfig {
    fn default() -> Self {
        Self {
            auto_compact_enabled: true,
            auto_compact_threshold: 0.8,
            context_window: 128_000,
            mode: AgentMode::Default,
        }
    }
}

/// Everything a policy may look at for one turn: the full history, the
/// messages this turn produced, running stats, and the active configuration
/// snapshot.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub messages: Vec<TurnMessage>,
    pub current_turn_messages: Vec<TurnMessage>,
    pub stats: TurnStats,
    pub config: TurnPolicyConfig,
}

impl TurnContext {
    pub fn new(config: TurnPolicyConfig) -> Self {
        Self {
            messages: Vec::new(),
            current_turn_messages: Vec::new(),
            stats: TurnStats::default(),
            config,
        }
    }

    pub fn latest_user_message(&self) -> Option<&TurnMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
    }
}

#[async_trait]
pub trait TurnMiddleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        MiddlewareResult::proceed()
    }

    async fn after_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        MiddlewareResult::proceed()
    }

    fn reset(&mut self, _reason: ResetReason) {}
}

#[derive(Error, Debug)]
pub enum MiddlewareError {
    #[error("inject_message is not allowed in after_turn (from `{policy}`)")]
    InjectAfterTurn { policy: String },
}

#[derive(Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Box<dyn TurnMiddleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Box<dyn TurnMiddleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn clear(&mut self) {
        self.middlewares.clear();
    }

    pub fn reset(&mut self, reason: ResetReason) {
        for middleware in &mut self.middlewares {
            middleware.reset(reason);
        }
    }

    /// Run every policy's before-turn. Stop/Compact short-circuit; inject
    /// messages accumulate into one combined message.
    pub async fn run_before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        let mut to_inject = Vec::new();

        for middleware in &mut self.middlewares {
            let result = middleware.before_turn(ctx).await;
            match result.action {
                MiddlewareAction::InjectMessage => {
                    if let Some(message) = result.message {
                        to_inject.push(message);
                    }
                }
                MiddlewareAction::Stop | MiddlewareAction::Compact => return result,
                MiddlewareAction::Continue => {}
            }
        }

        if to_inject.is_empty() {
            MiddlewareResult::proceed()
        } else {
            MiddlewareResult::inject(to_inject.join("\n\n"))
        }
    }

    /// Run every policy's after-turn. An inject here is a bug in the policy,
    /// not an input condition, so it surfaces as an error.
    pub async fn run_after_turn(
        &mut self,
        ctx: &TurnContext,
    ) -> Result<MiddlewareResult, MiddlewareError> {
        for middleware in &mut self.middlewares {
            let result = middleware.after_turn(ctx).await;
            match result.action {
                MiddlewareAction::InjectMessage => {
                    return Err(MiddlewareError::InjectAfterTurn {
                        policy: middleware.name().to_string(),
                    });
                }
                MiddlewareAction::Stop | MiddlewareAction::Compact => return Ok(result),
                MiddlewareAction::Continue => {}
            }
        }
        Ok(MiddlewareResult::proceed())
    }
}
