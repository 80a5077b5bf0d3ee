//! A conversation with an agent and the loop that drives it.
//!
//! The loop follows a **call → act → observe** cycle:
//!
//! 1. Send the history and tool definitions to the model
//! 2. If the reply has tool calls, execute each one and append the results
//! 3. Repeat until the model answers without tool calls, or the iteration
//!    limit is reached
//!
//! Each run is one trace: an agent-run span with the model calls and tool
//! executions nested under it.

use crate::agent::Agent;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracecheck_core::error::Error;
use tracecheck_core::message::{Conversation as History, Message, MessageToolCall, Role};
use tracecheck_core::tool::ToolCall;
use tracecheck_telemetry::{Span, SpanKind};
use tracing::{debug, info, warn};

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model replied without tool calls.
    Answered,
    /// The iteration limit was hit while the model still wanted tools.
    IterationLimit,
}

/// Summary of one `run_to_completion`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_message: String,
    pub finish: FinishReason,
    /// Model calls made
    pub iterations: u32,
    pub tool_calls: usize,
    pub trace_id: String,
}

pub struct Conversation {
    agent: Agent,
    workspace: PathBuf,
    history: History,
    pending: Vec<String>,
}

impl Conversation {
    pub fn new(agent: Agent, workspace: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            workspace: workspace.into(),
            history: History::new(),
            pending: Vec::new(),
        }
    }

    /// Queue a user message for the next run.
    pub fn submit(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.history.push(Message::user(&text));
        self.pending.push(text);
    }

    pub fn messages(&self) -> &[Message] {
        &self.history.messages
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Drive the agent until it answers or runs out of iterations.
    ///
    /// Model errors abort the run and are returned after the trace is
    /// exported. Tool failures do not: they are reported back to the model
    /// so it can recover.
    pub async fn run_to_completion(&mut self) -> Result<RunOutcome, Error> {
        if self.pending.is_empty() {
            return Err(Error::Internal(
                "run_to_completion called with no submitted message".into(),
            ));
        }
        let instruction = std::mem::take(&mut self.pending).join("\n");
        self.ensure_system_prompt();

        let client = &self.agent.client;
        let trace_id = client.open_trace(&self.agent.metadata, json!(instruction));
        let mut run_span = Span::new(SpanKind::AgentRun, "agent").with_input(json!(instruction));
        run_span
            .metadata
            .insert("workspace".into(), json!(self.workspace.display().to_string()));

        info!(
            conversation_id = %self.history.id,
            trace_id = %trace_id,
            max_iterations = self.agent.max_iterations,
            "Agent run started"
        );

        let definitions = self.agent.tools.definitions();
        let mut iterations = 0;
        let mut tool_calls = 0;

        let finish = loop {
            if iterations >= self.agent.max_iterations {
                warn!(
                    conversation_id = %self.history.id,
                    iterations,
                    "Max tool iterations reached"
                );
                break FinishReason::IterationLimit;
            }
            iterations += 1;
            debug!(conversation_id = %self.history.id, iteration = iterations, "Agent loop iteration");

            let response = match client
                .complete_traced(&trace_id, Some(run_span.id.as_str()), &self.history.messages, &definitions)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    run_span.fail(e.to_string());
                    client.record_span(&trace_id, run_span);
                    client
                        .close_trace(&trace_id, json!({ "error": e.to_string() }))
                        .await;
                    return Err(e.into());
                }
            };

            if response.message.tool_calls.is_empty() {
                self.history.push(response.message);
                break FinishReason::Answered;
            }

            let calls = response.message.tool_calls.clone();
            self.history.push(response.message);
            for call in &calls {
                let output = self.run_tool(&trace_id, &run_span.id, call).await;
                self.history.push(Message::tool_result(&call.id, output));
                tool_calls += 1;
            }
        };

        let final_message = self
            .history
            .last_assistant()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        run_span.output = json!(final_message);
        run_span
            .metadata
            .insert("iterations".into(), json!(iterations));
        run_span.end(finish == FinishReason::Answered);
        client.record_span(&trace_id, run_span);
        client.close_trace(&trace_id, json!(final_message)).await;

        info!(
            conversation_id = %self.history.id,
            iterations,
            tool_calls,
            finish = ?finish,
            "Agent run finished"
        );

        Ok(RunOutcome {
            final_message,
            finish,
            iterations,
            tool_calls,
            trace_id,
        })
    }

    fn ensure_system_prompt(&mut self) {
        let has_system = self
            .history
            .messages
            .first()
            .is_some_and(|m| m.role == Role::System);
        if !has_system {
            let prompt = format!(
                "{}\n\nWorkspace directory: {}",
                self.agent.system_prompt,
                self.workspace.display()
            );
            self.history.messages.insert(0, Message::system(prompt));
        }
    }

    /// Execute one tool call, record its span, and return the text for the
    /// tool-result message.
    async fn run_tool(&self, trace_id: &str, parent: &str, call: &MessageToolCall) -> String {
        let mut span = Span::new(SpanKind::ToolExecution, &call.name).with_parent(parent);

        let arguments = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                let message = format!("Error: invalid JSON arguments for {}: {e}", call.name);
                span = span.with_input(json!(call.arguments));
                span.fail(&message);
                self.agent.client.record_span(trace_id, span);
                return message;
            }
        };
        span = span.with_input(arguments.clone());

        let request = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments,
        };
        debug!(tool = %call.name, call_id = %call.id, "Executing tool call");

        let output = match self.agent.tools.execute(&request).await {
            Ok(result) => {
                span.output = json!(result.output);
                span.end(result.success);
                result.output
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                let message = format!("Error: {e}");
                span.fail(e.to_string());
                message
            }
        };
        self.agent.client.record_span(trace_id, span);
        output
    }
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, client_with, text_response, tool_call_response};
    use std::sync::Arc;
    use tracecheck_core::error::ProviderError;
    use tracecheck_core::tool::ToolRegistry;
    use tracecheck_tools::TaskTrackerTool;

    fn tracker_registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(TaskTrackerTool::new()));
        tools
    }

    #[tokio::test]
    async fn simple_text_response() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response(
            "Hello from tracecheck with Langfuse!",
        ))]));
        let client = client_with(provider.clone());
        let before = client.metrics();

        let agent = Agent::new(client.clone(), ToolRegistry::new());
        let mut conv = Conversation::new(agent, "/tmp/work");
        conv.submit("Say 'Hello from tracecheck with Langfuse!' Keep it brief.");

        let outcome = conv.run_to_completion().await.unwrap();
        assert_eq!(outcome.final_message, "Hello from tracecheck with Langfuse!");
        assert_eq!(outcome.finish, FinishReason::Answered);
        assert_eq!(outcome.iterations, 1);
        // System + User + Assistant
        assert_eq!(conv.messages().len(), 3);
        assert!(conv.messages()[0].content.contains("/tmp/work"));

        let after = client.metrics();
        assert!(after.accumulated_cost > before.accumulated_cost);
        assert_eq!(after.request_count, 1);
    }

    #[tokio::test]
    async fn custom_system_prompt_leads_the_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(text_response("Hi."))]));
        let agent = Agent::new(client_with(provider), ToolRegistry::new())
            .with_system_prompt("Answer in one word.");
        let mut conv = Conversation::new(agent, "/tmp/work");
        conv.submit("Greet me");

        conv.run_to_completion().await.unwrap();
        let system = &conv.messages()[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.starts_with("Answer in one word."));
        assert!(system.content.contains("/tmp/work"));
    }

    #[tokio::test]
    async fn tool_calls_are_executed_and_traced() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(
                "call_1",
                "task_tracker",
                r#"{"command":"plan","task_list":[{"title":"Answer"}]}"#,
            )),
            Ok(text_response("Done.")),
        ]));
        let client = client_with(provider.clone());
        let agent = Agent::new(client.clone(), tracker_registry());
        let mut conv = Conversation::new(agent, "/tmp/work");
        conv.submit("Plan, then answer");

        let outcome = conv.run_to_completion().await.unwrap();
        assert_eq!(outcome.final_message, "Done.");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(provider.call_count(), 2);

        let tool_msg = conv
            .messages()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.contains("[ ] Answer"));

        let trace = client.telemetry().get_trace(&outcome.trace_id).unwrap();
        assert_eq!(trace.llm_call_count(), 2);
        assert_eq!(trace.tool_execution_count(), 1);
        let run = trace
            .spans
            .iter()
            .find(|s| s.kind == SpanKind::AgentRun)
            .unwrap();
        assert!(
            trace
                .spans
                .iter()
                .filter(|s| s.kind != SpanKind::AgentRun)
                .all(|s| s.parent_id.as_deref() == Some(run.id.as_str()))
        );
        assert_eq!(client.metrics().tool_executions, 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("call_1", "teleport", "{}")),
            Ok(text_response("Recovered.")),
        ]));
        let client = client_with(provider);
        let mut conv = Conversation::new(Agent::new(client, ToolRegistry::new()), "/tmp");
        conv.submit("go");

        let outcome = conv.run_to_completion().await.unwrap();
        assert_eq!(outcome.final_message, "Recovered.");
        let tool_msg = conv.messages().iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.starts_with("Error:"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported_to_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("call_1", "task_tracker", "{not json")),
            Ok(text_response("ok")),
        ]));
        let client = client_with(provider);
        let mut conv = Conversation::new(Agent::new(client, tracker_registry()), "/tmp");
        conv.submit("go");

        conv.run_to_completion().await.unwrap();
        let tool_msg = conv.messages().iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.content.contains("invalid JSON arguments"));
    }

    #[tokio::test]
    async fn iteration_limit_stops_the_loop() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response("c1", "task_tracker", r#"{"command":"view"}"#)),
            Ok(tool_call_response("c2", "task_tracker", r#"{"command":"view"}"#)),
        ]));
        let client = client_with(provider.clone());
        let agent = Agent::new(client, tracker_registry()).with_max_iterations(2);
        let mut conv = Conversation::new(agent, "/tmp");
        conv.submit("loop forever");

        let outcome = conv.run_to_completion().await.unwrap();
        assert_eq!(outcome.finish, FinishReason::IterationLimit);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn provider_error_aborts_run() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let client = client_with(provider);
        let mut conv = Conversation::new(Agent::new(client.clone(), ToolRegistry::new()), "/tmp");
        conv.submit("hi");

        let err = conv.run_to_completion().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::AuthenticationFailed(_))
        ));
        assert_eq!(client.metrics().request_count, 1);
        assert_eq!(client.metrics().accumulated_total_tokens, 0);
    }

    #[tokio::test]
    async fn run_without_submit_is_an_error() {
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let client = client_with(provider.clone());
        let mut conv = Conversation::new(Agent::new(client, ToolRegistry::new()), "/tmp");
        assert!(matches!(
            conv.run_to_completion().await,
            Err(Error::Internal(_))
        ));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn follow_up_reuses_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(text_response("first")),
            Ok(text_response("second")),
        ]));
        let client = client_with(provider);
        let mut conv = Conversation::new(Agent::new(client, ToolRegistry::new()), "/tmp");

        conv.submit("one");
        conv.run_to_completion().await.unwrap();
        conv.submit("two");
        let outcome = conv.run_to_completion().await.unwrap();

        assert_eq!(outcome.final_message, "second");
        // One system prompt, two user turns, two answers
        assert_eq!(conv.messages().len(), 5);
        assert_eq!(
            conv.messages()
                .iter()
                .filter(|m| m.role == Role::System)
                .count(),
            1
        );
    }

    #[test]
    fn empty_arguments_parse_as_object() {
        assert_eq!(parse_arguments("").unwrap(), json!({}));
        assert_eq!(parse_arguments(r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_arguments("{").is_err());
    }
}
