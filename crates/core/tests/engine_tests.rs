//! End-to-end runs against scripted models and recording tools.

use std::sync::Arc;
use std::time::Duration;

use glue_core::protocol::Event;
use glue_core::secret::SecretResolver;
use glue_core::tool::ToolCallError;
use glue_core::{
    BuildOptions, Engine, EngineConfig, Program, ProviderCatalog, Providers, RetryPolicy, RunError,
};
use glue_llm::{ChatResponse, ChatRole, LLMError};
use glue_test_utils::{last_user_message, no_secrets, secrets, tool_call, RecordingTool, ScriptedLLM};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const RESEARCH: &str = r#"
glue app {
    name = "Research Assistant"
    tools = web_search
    model = researcher
}

researcher {
    openrouter
    os.openrouter_api_key
    model = "liquid/lfm-40b:free"
    temperature = 0.7
    double_side_tape = { web_search }
}

web_search {
    tavily
    os.tavily_api_key
}

researcher_role = "You are a research assistant. Summarize the search results."

apply glue
"#;

const TEAM: &str = r#"
glue app {
    name = "Autonomous Team"
    tools = web_search, file_handler, code_interpreter
    model = team
}

planner { openrouter }
researcher { openrouter }
executor { openrouter }
validator { openrouter }

web_search { tavily }
file_handler { local }
code_interpreter { python }

team {
    models = planner, researcher, executor, validator
    double_side_tape = { planner >> researcher >> executor >> validator >> planner }
    glue { web_search: researcher, file_handler: executor }
    magnets { code_interpreter: [executor, validator] }
}

apply glue
"#;

const LOOP: &str = r#"
glue app { model = review }
planner { openrouter }
validator { openrouter }
review {
    models = planner, validator
    double_side_tape = { planner >> validator >> planner }
}
apply glue
"#;

const SOLO: &str = "glue app { model = solo }\nsolo { openrouter }\napply glue";

struct Harness {
    llm: Arc<ScriptedLLM>,
    tools: Vec<(&'static str, Arc<RecordingTool>)>,
    secrets: Arc<dyn SecretResolver>,
    config: EngineConfig,
    options: BuildOptions,
}

impl Harness {
    fn new(llm: ScriptedLLM) -> Self {
        Self {
            llm: Arc::new(llm),
            tools: Vec::new(),
            secrets: no_secrets(),
            config: EngineConfig::default().retry(RetryPolicy::none()),
            options: BuildOptions::default(),
        }
    }

    fn tool(mut self, provider: &'static str, tool: RecordingTool) -> Self {
        self.tools.push((provider, Arc::new(tool)));
        self
    }

    fn secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = secrets;
        self
    }

    fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    fn recorder(&self, provider: &str) -> Arc<RecordingTool> {
        self.tools
            .iter()
            .find(|(p, _)| *p == provider)
            .map(|(_, t)| t.clone())
            .unwrap()
    }

    fn engine(&self, source: &str) -> Engine {
        let program = Program::parse(source, &ProviderCatalog::builtin(), &self.options).unwrap();
        let mut providers = Providers::new().with_model("openrouter", self.llm.clone());
        for (_, tool) in &self.tools {
            providers = providers.register_tool(tool.clone());
        }
        program.into_engine(providers, self.secrets.clone(), self.config.clone())
    }
}

fn team_tools(harness: Harness) -> Harness {
    harness
        .tool("tavily", RecordingTool::new("tavily"))
        .tool("local", RecordingTool::new("local"))
        .tool("python", RecordingTool::new("python"))
}

#[tokio::test]
async fn test_research_scenario() {
    let harness = Harness::new(ScriptedLLM::echo())
        .tool(
            "tavily",
            RecordingTool::with_responder("tavily", |_, args, _| {
                Ok(json!({
                    "query": args["input"],
                    "answer": "Rust 1.80 shipped LazyLock",
                    "results": [{"title": "Announcing Rust 1.80", "score": 0.97}]
                }))
            }),
        )
        .secrets(secrets(&[
            ("openrouter_api_key", "sk-or-test"),
            ("tavily_api_key", "tvly-test"),
        ]));
    let engine = harness.engine(RESEARCH);

    let output = engine.run("What is new in Rust?").await.unwrap();

    assert_eq!(output.iterations, 1);
    assert_eq!(output.trace.tool_calls().count(), 1);
    assert_eq!(output.trace.model_calls().count(), 1);
    assert!(output.artifact.contains("Rust 1.80 shipped LazyLock"));
    assert!(output.artifact.contains("Results from web_search"));

    let search = harness.recorder("tavily");
    let calls = search.calls();
    assert_eq!(calls[0].args, json!({"input": "What is new in Rust?"}));
    assert_eq!(calls[0].secret.as_deref(), Some("tvly-test"));

    let request = &harness.llm.calls()[0];
    assert_eq!(request.model, "liquid/lfm-40b:free");
    assert_eq!(request.api_key.as_ref().unwrap().expose(), "sk-or-test");
    assert_eq!(request.messages[0].role, ChatRole::System);
    // chained tools are not offered again
    assert!(request.tools.is_empty());
}

#[tokio::test]
async fn test_team_approval_on_first_iteration() {
    let llm = ScriptedLLM::new(|req, _| {
        let prompt = last_user_message(req);
        Ok(if prompt.contains("Input from executor") {
            ChatResponse::text("APPROVED\nAll steps verified.")
        } else {
            ChatResponse::text("step done")
        })
    });
    let harness = team_tools(Harness::new(llm));
    let engine = harness.engine(TEAM);

    let output = engine.run("Build a CLI that counts words").await.unwrap();

    assert_eq!(output.iterations, 1);
    assert!(output.artifact.starts_with("APPROVED"));
    assert_eq!(output.trace.model_calls().count(), 4);
    let planner_calls = harness
        .llm
        .calls()
        .iter()
        .filter(|r| !last_user_message(r).contains("Input from"))
        .count();
    assert_eq!(planner_calls, 1);
}

#[tokio::test]
async fn test_loop_budget_exceeded_at_cap() {
    let harness = Harness::new(ScriptedLLM::always("needs more work"))
        .config(EngineConfig::default().max_iterations(3));
    let engine = harness.engine(LOOP);

    let failure = engine.run("Draft a plan").await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::LoopBudgetExceeded { limit: 3 }
    ));
    assert_eq!(failure.trace.model_calls().count(), 6);
    let last = failure.last_state.unwrap();
    assert_eq!(last.model, "validator");
    assert_eq!(last.iteration, 3);
}

#[tokio::test]
async fn test_uneven_fan_in_waits_for_every_producer() {
    let source = r#"
glue app { model = pipeline }
a { openrouter }
b { openrouter }
d { openrouter }
pipeline {
    models = a, b, d
    double_side_tape = { a >> b >> d, a >> d }
}
apply glue
"#;
    let harness = Harness::new(ScriptedLLM::always("ok"))
        .config(EngineConfig::default().retry(RetryPolicy::none()).max_iterations(1));
    let engine = harness.engine(source);

    let output = engine.run("assemble").await.unwrap();

    assert_eq!(output.iterations, 1);
    assert_eq!(harness.llm.call_count(), 3);
    let calls = harness.llm.calls();
    let consumer = last_user_message(&calls[2]);
    assert!(consumer.contains("Input from a"));
    assert!(consumer.contains("Input from b"));
    assert!(calls[..2]
        .iter()
        .all(|r| !last_user_message(r).contains("Input from b")));
}

#[tokio::test]
async fn test_app_block_iteration_override() {
    let source = LOOP.replace("glue app { model = review }", "glue app { model = review, max_iterations = 2 }");
    let harness = Harness::new(ScriptedLLM::always("again"));
    let engine = harness.engine(&source);

    let failure = engine.run("x").await.unwrap_err();
    assert!(matches!(
        failure.error,
        RunError::LoopBudgetExceeded { limit: 2 }
    ));
    assert_eq!(harness.llm.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_magnet_tool_is_never_invoked_concurrently() {
    let source = r#"
glue app { tools = code_interpreter, model = crew }
lead { openrouter }
coder { openrouter }
tester { openrouter }
code_interpreter { python }
crew {
    models = lead, coder, tester
    double_side_tape = { lead >> coder, lead >> tester }
    magnets { code_interpreter: [coder, tester] }
}
apply glue
"#;
    let llm = ScriptedLLM::new(|req, index| {
        let answered = req.messages.iter().any(|m| m.role == ChatRole::Tool);
        Ok(if !req.tools.is_empty() && !answered {
            ChatResponse::with_tool_calls(vec![tool_call(
                &format!("call_{index}"),
                "code_interpreter",
                json!({"code": "print(1)"}),
            )])
        } else {
            ChatResponse::text("done")
        })
    });
    let harness = Harness::new(llm).tool(
        "python",
        RecordingTool::new("python").with_delay(Duration::from_millis(50)),
    );
    let engine = harness.engine(source);

    let output = engine.run("write and test").await.unwrap();

    let interpreter = harness.recorder("python");
    assert_eq!(output.artifact, "done");
    assert_eq!(interpreter.call_count(), 2);
    assert_eq!(interpreter.max_in_flight(), 1);
    assert_eq!(output.trace.tool_calls().count(), 2);
    let callers: Vec<String> = output
        .trace
        .tool_calls()
        .filter_map(|e| match &e.subject {
            glue_core::protocol::Subject::Tool { caller, .. } => Some(caller.clone()),
            _ => None,
        })
        .collect();
    assert!(callers.contains(&"coder".to_string()));
    assert!(callers.contains(&"tester".to_string()));
}

#[tokio::test]
async fn test_on_demand_tool_results_reach_the_model() {
    let source = "glue app { tools = web_search, model = r }\nr { openrouter }\nweb_search { tavily }\napply glue";
    let llm = ScriptedLLM::new(|req, _| {
        let tool_reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::Tool)
            .map(|m| m.content.clone());
        Ok(match tool_reply {
            Some(content) => ChatResponse::text(format!("summary of {content}")),
            None => ChatResponse::with_tool_calls(vec![
                tool_call("c1", "web_search", json!({"query": "tokio"})),
                tool_call("c2", "shell", json!({})),
            ]),
        })
    });
    let harness = Harness::new(llm).tool("tavily", RecordingTool::new("tavily"));
    let engine = harness.engine(source);

    let output = engine.run("look up tokio").await.unwrap();

    let search = harness.recorder("tavily");
    assert_eq!(search.calls()[0].args, json!({"query": "tokio"}));
    // the unknown tool is reported back instead of failing the run
    assert!(output.artifact.contains("not available"));
    let second = &harness.llm.calls()[1];
    assert!(second
        .messages
        .iter()
        .any(|m| m.role == ChatRole::Tool && m.content.contains("\"success\":true")));
}

#[tokio::test]
async fn test_secret_missing_stops_before_any_call() {
    let harness = Harness::new(ScriptedLLM::echo()).tool("tavily", RecordingTool::new("tavily"));
    let engine = harness.engine(RESEARCH);

    let failure = engine.run("anything").await.unwrap_err();

    match &failure.error {
        RunError::SecretMissing {
            subject, reference, ..
        } => {
            assert_eq!(subject, "web_search");
            assert_eq!(reference.name(), "tavily_api_key");
        }
        other => panic!("expected SecretMissing, got {other:?}"),
    }
    assert_eq!(harness.recorder("tavily").call_count(), 0);
    assert_eq!(harness.llm.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let llm = ScriptedLLM::new(|_, index| {
        if index < 2 {
            Err(LLMError::Unavailable {
                status: Some(503),
                message: "overloaded".into(),
            })
        } else {
            Ok(ChatResponse::text("finally"))
        }
    });
    let harness = Harness::new(llm).config(EngineConfig::default());
    let engine = harness.engine(SOLO);

    let output = engine.run("hello").await.unwrap();

    assert_eq!(output.artifact, "finally");
    assert_eq!(harness.llm.call_count(), 3);
    assert_eq!(output.trace.retries().count(), 2);
    assert_eq!(output.trace.model_calls().count(), 1);
    let attempts: Vec<u32> = output.trace.entries.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let llm = ScriptedLLM::new(|_, _| {
        Err(LLMError::Unavailable {
            status: Some(429),
            message: "rate limited".into(),
        })
    });
    let retry = RetryPolicy {
        max_retries: 1,
        ..RetryPolicy::default()
    };
    let harness = Harness::new(llm).config(EngineConfig::default().retry(retry));
    let engine = harness.engine(SOLO);

    let failure = engine.run("hello").await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::ProviderUnavailable { attempts: 2, .. }
    ));
    assert_eq!(failure.trace.entries.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_model_times_out() {
    let harness = Harness::new(ScriptedLLM::always("late").with_delay(Duration::from_secs(120)))
        .config(
            EngineConfig::default()
                .retry(RetryPolicy::none())
                .call_timeout(Duration::from_secs(1)),
        );
    let engine = harness.engine(SOLO);

    let failure = engine.run("hello").await.unwrap_err();

    assert!(matches!(
        failure.error,
        RunError::ProviderTimeout { attempts: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_tool_failure_in_chain_is_fatal() {
    let harness = Harness::new(ScriptedLLM::echo())
        .tool(
            "tavily",
            RecordingTool::with_responder("tavily", |_, _, _| {
                Err(ToolCallError::InvalidInput("empty query".into()))
            }),
        )
        .secrets(secrets(&[
            ("openrouter_api_key", "k"),
            ("tavily_api_key", "t"),
        ]));
    let engine = harness.engine(RESEARCH);

    let failure = engine.run("").await.unwrap_err();

    assert!(matches!(failure.error, RunError::Tool { ref tool, .. } if tool == "web_search"));
    assert_eq!(harness.llm.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_unwinds_the_run() {
    let harness = Harness::new(ScriptedLLM::always("slow").with_delay(Duration::from_secs(30)));
    let engine = harness.engine(SOLO);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let failure = engine.run_with_cancel("hello", cancel).await.unwrap_err();
    assert!(matches!(failure.error, RunError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_tool_call_releases_the_tool() {
    let source = "glue app { tools = code_interpreter, model = solo }\nsolo { openrouter }\ncode_interpreter { python }\napply glue";
    let llm = ScriptedLLM::new(|req, index| {
        let answered = req.messages.iter().any(|m| m.role == ChatRole::Tool);
        Ok(if answered {
            ChatResponse::text("done")
        } else {
            ChatResponse::with_tool_calls(vec![tool_call(
                &format!("call_{index}"),
                "code_interpreter",
                json!({"code": "print(1)"}),
            )])
        })
    });
    let harness = Harness::new(llm).tool(
        "python",
        RecordingTool::new("python").with_delay(Duration::from_secs(30)),
    );
    let engine = harness.engine(source);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let failure = engine.run_with_cancel("first", cancel).await.unwrap_err();
    assert!(matches!(failure.error, RunError::Cancelled));
    assert_eq!(harness.recorder("python").call_count(), 1);

    // A held lock would park this run until the timeout fires.
    let output = tokio::time::timeout(Duration::from_secs(120), engine.run("second"))
        .await
        .expect("tool lock was not released")
        .unwrap();
    assert_eq!(output.artifact, "done");
    assert_eq!(harness.recorder("python").call_count(), 2);
}

#[tokio::test]
async fn test_deferred_unknown_provider_fails_at_activation() {
    let mut harness = Harness::new(ScriptedLLM::echo());
    harness.options = BuildOptions::default().defer_unknown_providers();
    let engine = harness.engine("glue app { model = a }\na { mistral }\napply glue");

    let failure = engine.run("hello").await.unwrap_err();

    match failure.error {
        RunError::UnknownProvider { block, provider } => {
            assert_eq!(block, "a");
            assert_eq!(provider, "mistral");
        }
        other => panic!("expected UnknownProvider, got {other:?}"),
    }
    assert_eq!(harness.llm.call_count(), 0);
    assert!(failure.trace.entries.is_empty());
}

#[tokio::test]
async fn test_events_follow_the_run() {
    let harness = Harness::new(ScriptedLLM::always("APPROVED"));
    let engine = harness.engine(SOLO);
    let mut events = engine.take_event_receiver().await.unwrap();
    assert!(engine.take_event_receiver().await.is_none());

    let output = engine.run("hello").await.unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let done = matches!(event, Event::RunCompleted { .. });
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(matches!(seen.first(), Some(Event::RunStarted { entry, .. }) if entry == "solo"));
    assert!(seen
        .iter()
        .any(|e| matches!(e, Event::ModelOutput { output, .. } if output == "APPROVED")));
    match seen.last() {
        Some(Event::RunCompleted { run_id, .. }) => assert_eq!(*run_id, output.trace.run_id),
        other => panic!("expected RunCompleted, got {other:?}"),
    }
}
