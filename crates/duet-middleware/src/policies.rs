use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::{json, Map};

use crate::{
    AgentMode, MessageRole, MiddlewareResult, ResetReason, TurnContext, TurnMiddleware,
    WARNING_TAG,
};

/// Stops the loop once a configured turn ceiling is reached.
pub struct TurnLimit {
    max_turns: u32,
}

impl TurnLimit {
    pub fn new(max_turns: u32) -> Self {
        Self { max_turns }
    }
}

#[async_trait]
impl TurnMiddleware for TurnLimit {
    fn name(&self) -> &str {
        "turn_limit"
    }

    async fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.stats.turns >= self.max_turns {
            MiddlewareResult::stop(format!("Turn limit of {} reached", self.max_turns))
        } else {
            MiddlewareResult::proceed()
        }
    }
}

/// Stops the loop once cumulative session cost crosses the ceiling.
pub struct PriceLimit {
    max_price: f64,
}

impl PriceLimit {
    pub fn new(max_price: f64) -> Self {
        Self { max_price }
    }
}

#[async_trait]
impl TurnMiddleware for PriceLimit {
    fn name(&self) -> &str {
        "price_limit"
    }

    async fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.stats.session_cost > self.max_price {
            MiddlewareResult::stop(format!(
                "Price limit exceeded: ${:.4} > ${:.2}",
                ctx.stats.session_cost, self.max_price
            ))
        } else {
            MiddlewareResult::proceed()
        }
    }
}

/// Requests context compaction once token usage crosses the configured
/// fraction of the context window. Suppressed in plan mode.
pub struct AutoCompact;

#[async_trait]
impl TurnMiddleware for AutoCompact {
    fn name(&self) -> &str {
        "auto_compact"
    }

    async fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.config.mode == AgentMode::Plan {
            return MiddlewareResult::proceed();
        }
        if !ctx.config.auto_compact_enabled
            || ctx.stats.context_tokens == 0
            || ctx.config.context_window == 0
        {
            return MiddlewareResult::proceed();
        }

        let usage = ctx.stats.context_tokens as f64 / ctx.config.context_window as f64;
        if usage >= ctx.config.auto_compact_threshold {
            let mut metadata = Map::new();
            metadata.insert("old_tokens".to_string(), json!(ctx.stats.context_tokens));
            metadata.insert(
                "threshold".to_string(),
                json!(ctx.config.auto_compact_threshold),
            );
            MiddlewareResult::compact(metadata)
        } else {
            MiddlewareResult::proceed()
        }
    }
}

pub const PLAN_MODE_REMINDER: &str = "Plan mode is active. Do not edit files, run \
mutating tools, or change system state; research, then present the full plan and \
wait for confirmation.";

/// Repeats the plan-mode reminder at the start of each turn while plan mode
/// is active.
pub struct PlanReminder {
    reminder: String,
}

impl PlanReminder {
    pub fn new() -> Self {
        Self {
            reminder: PLAN_MODE_REMINDER.to_string(),
        }
    }

    pub fn with_reminder(reminder: impl Into<String>) -> Self {
        Self {
            reminder: reminder.into(),
        }
    }
}

impl Default for PlanReminder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TurnMiddleware for PlanReminder {
    fn name(&self) -> &str {
        "plan_reminder"
    }

    async fn before_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        if ctx.config.mode == AgentMode::Plan {
            MiddlewareResult::inject(format!(
                "<{tag}>{}</{tag}>",
                self.reminder,
                tag = WARNING_TAG
            ))
        } else {
            MiddlewareResult::proceed()
        }
    }
}

/// Detects repetitive assistant output and tool calls.
///
/// Two signals with different consequences: a short contiguous run inside a
/// sliding window queues a one-shot warning injected at the start of the
/// next turn, while an exact turn output repeating past the strict threshold
/// is a hard stop.
pub struct LoopDetection {
    recent_tool_calls: VecDeque<String>,
    recent_responses: VecDeque<String>,
    repetition_counts: HashMap<String, u32>,
    pending_warning: Option<String>,
}

impl LoopDetection {
    pub const WINDOW_SIZE: usize = 10;
    pub const REPETITION_THRESHOLD: usize = 5;
    pub const STRICT_REPETITION_THRESHOLD: u32 = 75;

    pub fn new() -> Self {
        Self {
            recent_tool_calls: VecDeque::with_capacity(Self::WINDOW_SIZE),
            recent_responses: VecDeque::with_capacity(Self::WINDOW_SIZE),
            repetition_counts: HashMap::new(),
            pending_warning: None,
        }
    }

    fn push_bounded(window: &mut VecDeque<String>, entry: String) {
        if window.len() == Self::WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(entry);
    }

    fn detect_loop(&self) -> Option<&'static str> {
        if self.recent_responses.len() >= Self::REPETITION_THRESHOLD
            && has_contiguous_run(&self.recent_responses, Self::REPETITION_THRESHOLD)
        {
            return Some("repetitive model responses");
        }
        if self.recent_tool_calls.len() >= Self::REPETITION_THRESHOLD
            && has_contiguous_run(&self.recent_tool_calls, Self::REPETITION_THRESHOLD)
        {
            return Some("repetitive tool calls");
        }
        None
    }
}

impl Default for LoopDetection {
    fn default() -> Self {
        Self::new()
    }
}

fn has_contiguous_run(window: &VecDeque<String>, run: usize) -> bool {
    let items: Vec<&String> = window.iter().collect();
    items
        .windows(run)
        .any(|chunk| chunk.iter().all(|item| *item == chunk[0]))
}

#[async_trait]
impl TurnMiddleware for LoopDetection {
    fn name(&self) -> &str {
        "loop_detection"
    }

    async fn before_turn(&mut self, _ctx: &TurnContext) -> MiddlewareResult {
        if let Some(warning) = self.pending_warning.take() {
            MiddlewareResult::inject(warning)
        } else {
            MiddlewareResult::proceed()
        }
    }

    async fn after_turn(&mut self, ctx: &TurnContext) -> MiddlewareResult {
        let mut response = String::new();
        let mut signatures = Vec::new();
        for message in &ctx.current_turn_messages {
            if message.role == MessageRole::Assistant && !message.content.is_empty() {
                response.push_str(&message.content);
            }
            for call in &message.tool_calls {
                signatures.push(call.signature());
            }
        }

        let total_output = format!("{}{}", response, signatures.join("|"));
        if !total_output.is_empty() {
            // Anything different resets the strict counter entirely.
            if let Some(count) = self.repetition_counts.get_mut(&total_output) {
                *count += 1;
            } else {
                self.repetition_counts.clear();
                self.repetition_counts.insert(total_output.clone(), 1);
            }

            if self.repetition_counts[&total_output] >= Self::STRICT_REPETITION_THRESHOLD {
                return MiddlewareResult::stop(format!(
                    "Strict repetition threshold reached ({}x same output)",
                    Self::STRICT_REPETITION_THRESHOLD
                ));
            }
        }

        if !response.is_empty() {
            Self::push_bounded(&mut self.recent_responses, response);
        }
        if !signatures.is_empty() {
            Self::push_bounded(&mut self.recent_tool_calls, signatures.join("|"));
        }

        // after_turn cannot inject; queue the warning for the next turn.
        self.pending_warning = self.detect_loop().map(|reason| {
            format!(
                "<{tag}>Loop detected ({reason}). Analyze your recent actions and adjust \
                 your strategy to avoid repetition.</{tag}>",
                reason = reason,
                tag = WARNING_TAG
            )
        });

        MiddlewareResult::proceed()
    }

    fn reset(&mut self, _reason: ResetReason) {
        self.recent_tool_calls.clear();
        self.recent_responses.clear();
        self.repetition_counts.clear();
        self.pending_warning = None;
    }
}
