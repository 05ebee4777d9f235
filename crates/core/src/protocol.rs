use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run IDs identify one `Engine::run` invocation
pub type RunId = Uuid;

/// What an invocation targeted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    Model { name: String },
    Tool { name: String, caller: String },
}

impl Subject {
    pub fn name(&self) -> &str {
        match self {
            Subject::Model { name } | Subject::Tool { name, .. } => name,
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Subject::Tool { .. })
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { output: String },
    /// Transient failure; another attempt follows.
    Retry { error: String },
    Failure { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub subject: Subject,
    pub attempt: u32,
    pub outcome: Outcome,
    pub duration_ms: u64,
}

/// Every invocation attempt of a run, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub run_id: RunId,
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            entries: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        iteration: u32,
        subject: Subject,
        attempt: u32,
        outcome: Outcome,
        duration_ms: u64,
    ) {
        let seq = self.entries.len() as u64;
        self.entries.push(TraceEntry {
            seq,
            timestamp: Utc::now(),
            iteration,
            subject,
            attempt,
            outcome,
            duration_ms,
        });
    }

    /// Final attempts (success or failure) against models.
    pub fn model_calls(&self) -> impl Iterator<Item = &TraceEntry> {
        self.finished().filter(|e| !e.subject.is_tool())
    }

    /// Final attempts (success or failure) against tools.
    pub fn tool_calls(&self) -> impl Iterator<Item = &TraceEntry> {
        self.finished().filter(|e| e.subject.is_tool())
    }

    pub fn retries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Retry { .. }))
    }

    fn finished(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries
            .iter()
            .filter(|e| !matches!(e.outcome, Outcome::Retry { .. }))
    }
}

/// Progress events streamed while a run executes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A run has started at its entry model
    RunStarted {
        run_id: RunId,
        app: String,
        entry: String,
    },

    /// A wave of models is about to run
    IterationStarted {
        run_id: RunId,
        iteration: u32,
        models: Vec<String>,
    },

    ModelInvoked {
        run_id: RunId,
        model: String,
        iteration: u32,
    },

    ModelOutput {
        run_id: RunId,
        model: String,
        iteration: u32,
        output: String,
    },

    /// Tool call requested, by a chain or by the model
    ToolInvoked {
        run_id: RunId,
        tool: String,
        caller: String,
        arguments: serde_json::Value,
    },

    ToolResult {
        run_id: RunId,
        tool: String,
        caller: String,
        success: bool,
        result: serde_json::Value,
    },

    /// A transient failure; the call is retried after `delay_ms`
    Retrying {
        run_id: RunId,
        subject: Subject,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    RunCompleted {
        run_id: RunId,
        iterations: u32,
        artifact: String,
    },

    RunFailed { run_id: RunId, error: String },
}
