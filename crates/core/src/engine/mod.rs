//! Executes a program: model and tool invocation over the binding graph.
//!
//! A run walks the tape bindings wave by wave from the entry model. Models
//! in the same wave are invoked concurrently; a model only runs after the
//! wave holding its producer finished. Revisiting a model starts a new
//! iteration, and the run fails once `max_iterations` is used up.

mod config;
mod error;

pub use config::{EngineConfig, RetryPolicy};
pub use error::{RunError, RunFailure, RunOutput, StepOutput};

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use glue_llm::{ApiKey, ChatMessage, ChatProvider, ChatRequest, ChatResponse, LLMError, ToolCall};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::graph::{BindingGraph, NodeId};
use crate::protocol::{Event, Outcome, RunId, Subject, Trace};
use crate::providers::Providers;
use crate::registry::{ModelSpec, Registry, ToolSpec};
use crate::secret::{SecretRef, SecretResolver, SecretValue};
use crate::tool::{chat_tool, output_text, ToolCallError, ToolCallResult, ToolClient, ToolContext};

/// Lifecycle of a tool instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolState {
    #[default]
    Idle,
    Invoking,
}

/// Holds a tool's lock for one invocation; the state returns to `Idle` on
/// drop, including when the run is cancelled mid-call.
struct InvocationGuard<'a>(MutexGuard<'a, ToolState>);

impl<'a> InvocationGuard<'a> {
    async fn acquire(lock: &'a Mutex<ToolState>) -> Self {
        let mut state = lock.lock().await;
        *state = ToolState::Invoking;
        Self(state)
    }
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        *self.0 = ToolState::Idle;
    }
}

/// How a single attempt failed.
enum Attempt {
    TimedOut(String),
    Transient(String),
    Fatal(RunError),
}

fn classify_llm(model: &str, err: LLMError) -> Attempt {
    match err {
        LLMError::Timeout(message) => Attempt::TimedOut(message),
        err if err.is_retryable() => Attempt::Transient(err.to_string()),
        source => Attempt::Fatal(RunError::Provider {
            model: model.to_string(),
            source,
        }),
    }
}

fn classify_tool(tool: &str, err: ToolCallError) -> Attempt {
    match err {
        ToolCallError::Timeout(message) => Attempt::TimedOut(message),
        ToolCallError::Unavailable(message) => Attempt::Transient(message),
        source => Attempt::Fatal(RunError::Tool {
            tool: tool.to_string(),
            source,
        }),
    }
}

fn summarize_response(response: &ChatResponse) -> String {
    if response.tool_calls.is_empty() {
        return response.to_string();
    }
    let names: Vec<&str> = response
        .tool_calls
        .iter()
        .map(|c| c.function.name.as_str())
        .collect();
    format!("tool calls: {}", names.join(", "))
}

fn compose_prompt(task: &str, inputs: &[(String, String)], chain: &[(String, String)]) -> String {
    if inputs.is_empty() && chain.is_empty() {
        return task.to_string();
    }
    let mut prompt = format!("Task:\n{task}");
    for (model, output) in inputs {
        let _ = write!(prompt, "\n\nInput from {model}:\n{output}");
    }
    for (tool, result) in chain {
        let _ = write!(prompt, "\n\nResults from {tool}:\n{result}");
    }
    prompt
}

/// Per-run bookkeeping shared by every invocation of the run.
struct RunState {
    run_id: RunId,
    input: String,
    cancel: CancellationToken,
    trace: Mutex<Trace>,
}

impl RunState {
    async fn record(
        &self,
        iteration: u32,
        subject: Subject,
        attempt: u32,
        outcome: Outcome,
        duration_ms: u64,
    ) {
        self.trace
            .lock()
            .await
            .record(iteration, subject, attempt, outcome, duration_ms);
    }
}

struct ModelSlot<'a> {
    spec: &'a ModelSpec,
    provider: Arc<dyn ChatProvider>,
}

struct ToolSlot<'a> {
    spec: &'a ToolSpec,
    client: Arc<dyn ToolClient>,
    lock: Arc<Mutex<ToolState>>,
}

/// Clients resolved for every declared model and tool.
struct Activation<'a> {
    models: HashMap<NodeId, ModelSlot<'a>>,
    tools: HashMap<NodeId, ToolSlot<'a>>,
}

pub struct Engine {
    registry: Registry,
    graph: BindingGraph,
    providers: Providers,
    secrets: Arc<dyn SecretResolver>,
    config: EngineConfig,
    tool_locks: HashMap<NodeId, Arc<Mutex<ToolState>>>,
    tx_event: mpsc::Sender<Event>,
    rx_event: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl Engine {
    pub fn new(
        registry: Registry,
        graph: BindingGraph,
        providers: Providers,
        secrets: Arc<dyn SecretResolver>,
        config: EngineConfig,
    ) -> Self {
        let tool_locks = registry
            .tools()
            .iter()
            .filter_map(|t| graph.id(&t.name))
            .map(|id| (id, Arc::new(Mutex::new(ToolState::Idle))))
            .collect();
        let (tx_event, rx_event) = mpsc::channel(config.channel_buffer);
        Self {
            registry,
            graph,
            providers,
            secrets,
            config,
            tool_locks,
            tx_event,
            rx_event: Mutex::new(Some(rx_event)),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn graph(&self) -> &BindingGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stream of run events. Only the first caller gets it.
    pub async fn take_event_receiver(&self) -> Option<ReceiverStream<Event>> {
        self.rx_event.lock().await.take().map(ReceiverStream::new)
    }

    fn emit(&self, event: Event) {
        if let Err(e) = self.tx_event.try_send(event) {
            debug!("Run event dropped: {e}");
        }
    }

    pub async fn run(&self, input: &str) -> Result<RunOutput, RunFailure> {
        self.run_with_cancel(input, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutput, RunFailure> {
        let run_id = Uuid::new_v4();
        let run = RunState {
            run_id,
            input: input.to_string(),
            cancel,
            trace: Mutex::new(Trace::new(run_id)),
        };

        let mut last_state = None;
        let result = match self.activate() {
            Ok(activation) => self.drive(&run, &activation, &mut last_state).await,
            Err(e) => Err(e),
        };

        let trace = run.trace.into_inner();
        match result {
            Ok((artifact, iterations)) => {
                info!("Run {run_id} completed after {iterations} iteration(s)");
                self.emit(Event::RunCompleted {
                    run_id,
                    iterations,
                    artifact: artifact.clone(),
                });
                Ok(RunOutput {
                    artifact,
                    trace,
                    iterations,
                })
            }
            Err(error) => {
                warn!("Run {run_id} failed: {error}");
                self.emit(Event::RunFailed {
                    run_id,
                    error: error.to_string(),
                });
                Err(RunFailure {
                    error,
                    trace,
                    last_state,
                })
            }
        }
    }

    /// Check every declared block has a registered client.
    fn activate(&self) -> Result<Activation<'_>, RunError> {
        let mut models = HashMap::new();
        for spec in self.registry.models() {
            let provider = self.providers.model(&spec.provider).ok_or_else(|| {
                RunError::UnknownProvider {
                    block: spec.name.clone(),
                    provider: spec.provider.clone(),
                }
            })?;
            if let Some(id) = self.graph.id(&spec.name) {
                models.insert(id, ModelSlot { spec, provider });
            }
        }

        let mut tools = HashMap::new();
        for spec in self.registry.tools() {
            let client = self.providers.tool(&spec.provider).ok_or_else(|| {
                RunError::UnknownProvider {
                    block: spec.name.clone(),
                    provider: spec.provider.clone(),
                }
            })?;
            let Some(id) = self.graph.id(&spec.name) else {
                continue;
            };
            let lock = self
                .tool_locks
                .get(&id)
                .cloned()
                .unwrap_or_else(|| Arc::new(Mutex::new(ToolState::Idle)));
            tools.insert(id, ToolSlot { spec, client, lock });
        }

        Ok(Activation { models, tools })
    }

    fn unresolved(&self, id: NodeId) -> RunError {
        RunError::UnknownProvider {
            block: self.graph.name(id).to_string(),
            provider: "<unresolved>".to_string(),
        }
    }

    /// Wavefront traversal. Returns the artifact and the iteration count.
    async fn drive(
        &self,
        run: &RunState,
        act: &Activation<'_>,
        last: &mut Option<StepOutput>,
    ) -> Result<(String, u32), RunError> {
        let entry = self.graph.entry();
        self.emit(Event::RunStarted {
            run_id: run.run_id,
            app: self.registry.app().name.clone(),
            entry: self.graph.name(entry).to_string(),
        });

        let reachable = self.graph.reachable(entry);
        let mut wave = vec![entry];
        // Models finished in the current iteration.
        let mut done: HashSet<NodeId> = HashSet::new();
        // Targets of feedback edges fired in the current iteration.
        let mut looping: Vec<NodeId> = Vec::new();
        let mut outputs: HashMap<NodeId, String> = HashMap::new();
        let mut iteration = 1;

        loop {
            if run.cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            debug!(
                "Iteration {iteration}: running {:?}",
                wave.iter().map(|m| self.graph.name(*m)).collect::<Vec<_>>()
            );
            self.emit(Event::IterationStarted {
                run_id: run.run_id,
                iteration,
                models: wave.iter().map(|m| self.graph.name(*m).to_string()).collect(),
            });

            let jobs: Vec<(NodeId, Vec<(String, String)>)> = wave
                .iter()
                .map(|&model| {
                    let inputs = self
                        .graph
                        .predecessors(model)
                        .into_iter()
                        .filter_map(|p| {
                            outputs
                                .get(&p)
                                .map(|o| (self.graph.name(p).to_string(), o.clone()))
                        })
                        .collect();
                    (model, inputs)
                })
                .collect();
            let results = join_all(
                jobs.into_iter()
                    .map(|(model, inputs)| self.invoke_model(run, act, model, iteration, inputs)),
            )
            .await;

            let mut approved = None;
            for (&model, result) in wave.iter().zip(results) {
                let output = result?;
                *last = Some(StepOutput {
                    model: self.graph.name(model).to_string(),
                    output: output.clone(),
                    iteration,
                });
                if approved.is_none() && self.config.is_approval(&output) {
                    info!("`{}` approved in iteration {iteration}", self.graph.name(model));
                    approved = Some(output.clone());
                }
                outputs.insert(model, output);
            }
            if let Some(artifact) = approved {
                return Ok((artifact, iteration));
            }

            done.extend(wave.iter().copied());
            let mut next: Vec<NodeId> = Vec::new();
            for &model in &wave {
                for successor in self.graph.successors(model) {
                    if self.graph.is_feedback(model, successor) {
                        if !looping.contains(&successor) {
                            looping.push(successor);
                        }
                        continue;
                    }
                    let ready = self
                        .graph
                        .forward_predecessors(successor)
                        .iter()
                        .all(|p| done.contains(p) || !reachable.contains(p));
                    if ready && !done.contains(&successor) && !next.contains(&successor) {
                        next.push(successor);
                    }
                }
            }

            if next.is_empty() {
                if looping.is_empty() {
                    let artifact = last.as_ref().map(|s| s.output.clone()).unwrap_or_default();
                    return Ok((artifact, iteration));
                }
                if iteration >= self.config.max_iterations {
                    return Err(RunError::LoopBudgetExceeded {
                        limit: self.config.max_iterations,
                    });
                }
                iteration += 1;
                done.clear();
                next = std::mem::take(&mut looping);
            }
            wave = next;
        }
    }

    /// Chain first, then the model with its on-demand tools.
    async fn invoke_model(
        &self,
        run: &RunState,
        act: &Activation<'_>,
        model: NodeId,
        iteration: u32,
        inputs: Vec<(String, String)>,
    ) -> Result<String, RunError> {
        let slot = act.models.get(&model).ok_or_else(|| self.unresolved(model))?;
        let spec = slot.spec;
        self.emit(Event::ModelInvoked {
            run_id: run.run_id,
            model: spec.name.clone(),
            iteration,
        });

        let mut text = if inputs.is_empty() {
            run.input.clone()
        } else {
            inputs
                .iter()
                .map(|(_, output)| output.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        };
        let mut chain_results = Vec::new();
        for tool_name in &spec.chain {
            let Some(tool) = self.graph.id(tool_name) else {
                continue;
            };
            let tool_slot = act.tools.get(&tool).ok_or_else(|| self.unresolved(tool))?;
            let args = tool_slot.client.prepare_input(tool_slot.spec, &text);
            let value = self
                .invoke_tool(run, act, tool, &spec.name, iteration, args)
                .await?;
            text = output_text(&value);
            chain_results.push((tool_name.clone(), text.clone()));
        }

        let mut messages = Vec::new();
        if let Some(role) = &spec.role {
            messages.push(ChatMessage::system().content(role.clone()).build());
        }
        messages.push(
            ChatMessage::user()
                .content(compose_prompt(&run.input, &inputs, &chain_results))
                .build(),
        );

        let offered: Vec<NodeId> = self
            .graph
            .tools_of(model)
            .into_iter()
            .map(|(tool, _)| tool)
            .filter(|tool| !spec.chain.iter().any(|c| c == self.graph.name(*tool)))
            .collect();
        let tools: Vec<_> = offered
            .iter()
            .filter_map(|tool| act.tools.get(tool))
            .map(|t| chat_tool(t.client.as_ref(), t.spec))
            .collect();

        let mut rounds = 0;
        loop {
            let offer = !tools.is_empty() && rounds < self.config.max_tool_rounds;
            let request = ChatRequest::new(spec.model.clone(), messages.clone())
                .temperature(spec.temperature)
                .max_tokens(spec.max_tokens)
                .top_p(spec.top_p)
                .tools(if offer { tools.clone() } else { Vec::new() });
            let response = self.call_model(run, slot, iteration, request).await?;

            if !offer || response.tool_calls.is_empty() {
                let output = response.text.unwrap_or_default();
                self.emit(Event::ModelOutput {
                    run_id: run.run_id,
                    model: spec.name.clone(),
                    iteration,
                    output: output.clone(),
                });
                return Ok(output);
            }

            rounds += 1;
            messages.push(
                ChatMessage::assistant()
                    .content(response.text.clone().unwrap_or_default())
                    .tool_calls(response.tool_calls.clone())
                    .build(),
            );
            for call in &response.tool_calls {
                let result = self
                    .answer_tool_call(run, act, &offered, &spec.name, iteration, call)
                    .await?;
                messages.push(
                    ChatMessage::tool(call.id.clone())
                        .content(serde_json::to_string(&result).unwrap_or_default())
                        .build(),
                );
            }
        }
    }

    /// Failures are reported back to the model; only cancellation and
    /// missing secrets abort the run.
    async fn answer_tool_call(
        &self,
        run: &RunState,
        act: &Activation<'_>,
        offered: &[NodeId],
        caller: &str,
        iteration: u32,
        call: &ToolCall,
    ) -> Result<ToolCallResult, RunError> {
        let name = &call.function.name;
        let failed = |arguments: Value, error: String| ToolCallResult {
            tool_name: name.clone(),
            success: false,
            arguments,
            result: json!({ "error": error }),
        };

        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(args) => args,
                Err(e) => {
                    return Ok(failed(
                        Value::String(call.function.arguments.clone()),
                        format!("invalid arguments: {e}"),
                    ))
                }
            }
        };

        let Some(&tool) = offered.iter().find(|t| self.graph.name(**t) == name.as_str()) else {
            warn!("`{caller}` asked for unavailable tool `{name}`");
            return Ok(failed(
                arguments,
                format!("tool `{name}` is not available to `{caller}`"),
            ));
        };

        match self
            .invoke_tool(run, act, tool, caller, iteration, arguments.clone())
            .await
        {
            Ok(result) => Ok(ToolCallResult {
                tool_name: name.clone(),
                success: true,
                arguments,
                result,
            }),
            Err(e @ (RunError::Cancelled | RunError::SecretMissing { .. })) => Err(e),
            Err(e) => {
                warn!("Tool `{name}` failed for `{caller}`: {e}");
                Ok(failed(arguments, e.to_string()))
            }
        }
    }

    async fn resolve_secret(
        &self,
        subject: &str,
        reference: Option<&SecretRef>,
    ) -> Result<Option<SecretValue>, RunError> {
        let Some(reference) = reference else {
            return Ok(None);
        };
        self.secrets
            .resolve(reference)
            .await
            .map(Some)
            .map_err(|source| RunError::SecretMissing {
                subject: subject.to_string(),
                reference: reference.clone(),
                source,
            })
    }

    async fn call_model(
        &self,
        run: &RunState,
        slot: &ModelSlot<'_>,
        iteration: u32,
        request: ChatRequest,
    ) -> Result<ChatResponse, RunError> {
        let spec = slot.spec;
        let provider = &slot.provider;
        let request = &request;
        let subject = Subject::Model {
            name: spec.name.clone(),
        };
        self.call_with_retry(run, iteration, subject, summarize_response, move || async move {
            let key = match self.resolve_secret(&spec.name, spec.secret.as_ref()).await {
                Ok(key) => key,
                Err(e) => return Err(Attempt::Fatal(e)),
            };
            let request = request.clone().api_key(key.map(ApiKey::from));
            provider
                .chat(request)
                .await
                .map_err(|e| classify_llm(&spec.name, e))
        })
        .await
    }

    async fn invoke_tool(
        &self,
        run: &RunState,
        act: &Activation<'_>,
        tool: NodeId,
        caller: &str,
        iteration: u32,
        args: Value,
    ) -> Result<Value, RunError> {
        let slot = act.tools.get(&tool).ok_or_else(|| self.unresolved(tool))?;
        let spec = slot.spec;

        let _guard = tokio::select! {
            _ = run.cancel.cancelled() => return Err(RunError::Cancelled),
            guard = InvocationGuard::acquire(&slot.lock) => guard,
        };

        self.emit(Event::ToolInvoked {
            run_id: run.run_id,
            tool: spec.name.clone(),
            caller: caller.to_string(),
            arguments: args.clone(),
        });

        let client = &slot.client;
        let args_ref = &args;
        let subject = Subject::Tool {
            name: spec.name.clone(),
            caller: caller.to_string(),
        };
        let result = self
            .call_with_retry(run, iteration, subject, output_text, move || async move {
                let secret = match self.resolve_secret(&spec.name, spec.secret.as_ref()).await {
                    Ok(secret) => secret,
                    Err(e) => return Err(Attempt::Fatal(e)),
                };
                let ctx = ToolContext { tool: spec, secret };
                client
                    .invoke(ctx, args_ref.clone())
                    .await
                    .map_err(|e| classify_tool(&spec.name, e))
            })
            .await;

        self.emit(Event::ToolResult {
            run_id: run.run_id,
            tool: spec.name.clone(),
            caller: caller.to_string(),
            success: result.is_ok(),
            result: match &result {
                Ok(value) => value.clone(),
                Err(e) => json!({ "error": e.to_string() }),
            },
        });
        result
    }

    /// One logical call: each attempt races cancellation and the call
    /// timeout, transient failures back off and retry, and every attempt is
    /// traced.
    async fn call_with_retry<T, F, Fut>(
        &self,
        run: &RunState,
        iteration: u32,
        subject: Subject,
        summarize: fn(&T) -> String,
        mut attempt: F,
    ) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt>>,
    {
        let timeout = self.config.call_timeout;
        let max_attempts = self.config.retry.max_retries.saturating_add(1);
        let mut n = 1;

        loop {
            let started = Instant::now();
            let result = tokio::select! {
                _ = run.cancel.cancelled() => Err(Attempt::Fatal(RunError::Cancelled)),
                r = tokio::time::timeout(timeout, attempt()) => r.unwrap_or_else(|_| {
                    Err(Attempt::TimedOut(format!("no response within {timeout:?}")))
                }),
            };
            let elapsed = started.elapsed().as_millis() as u64;

            let (timed_out, message) = match result {
                Ok(value) => {
                    let output = summarize(&value);
                    run.record(iteration, subject, n, Outcome::Success { output }, elapsed)
                        .await;
                    return Ok(value);
                }
                Err(Attempt::Fatal(error)) => {
                    let outcome = Outcome::Failure {
                        error: error.to_string(),
                    };
                    run.record(iteration, subject, n, outcome, elapsed).await;
                    return Err(error);
                }
                Err(Attempt::TimedOut(message)) => (true, message),
                Err(Attempt::Transient(message)) => (false, message),
            };

            if n >= max_attempts {
                let outcome = Outcome::Failure {
                    error: message.clone(),
                };
                run.record(iteration, subject.clone(), n, outcome, elapsed)
                    .await;
                let subject = subject.name().to_string();
                return Err(if timed_out {
                    RunError::ProviderTimeout {
                        subject,
                        attempts: n,
                    }
                } else {
                    RunError::ProviderUnavailable {
                        subject,
                        attempts: n,
                        message,
                    }
                });
            }

            let delay = self.config.retry.backoff(n);
            debug!(
                "`{}` attempt {n} failed ({message}), retrying in {delay:?}",
                subject.name()
            );
            let outcome = Outcome::Retry {
                error: message.clone(),
            };
            run.record(iteration, subject.clone(), n, outcome, elapsed)
                .await;
            self.emit(Event::Retrying {
                run_id: run.run_id,
                subject: subject.clone(),
                attempt: n,
                delay_ms: delay.as_millis() as u64,
                error: message,
            });

            tokio::select! {
                _ = run.cancel.cancelled() => return Err(RunError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("hi", &[], &[]), "hi");
        let prompt = compose_prompt(
            "find x",
            &[("planner".into(), "plan".into())],
            &[("web_search".into(), "results".into())],
        );
        assert_eq!(
            prompt,
            "Task:\nfind x\n\nInput from planner:\nplan\n\nResults from web_search:\nresults"
        );
    }

    #[test]
    fn test_classify_llm_errors() {
        assert!(matches!(
            classify_llm("m", LLMError::Timeout("t".into())),
            Attempt::TimedOut(_)
        ));
        assert!(matches!(
            classify_llm(
                "m",
                LLMError::Unavailable {
                    status: Some(503),
                    message: "down".into()
                }
            ),
            Attempt::Transient(_)
        ));
        assert!(matches!(
            classify_llm("m", LLMError::AuthError("no".into())),
            Attempt::Fatal(RunError::Provider { .. })
        ));
    }

    #[tokio::test]
    async fn test_guard_resets_state() {
        let lock = Mutex::new(ToolState::Idle);
        {
            let _guard = InvocationGuard::acquire(&lock).await;
            assert!(lock.try_lock().is_err());
        }
        assert_eq!(*lock.lock().await, ToolState::Idle);
    }
}
