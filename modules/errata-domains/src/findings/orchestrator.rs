//! Multi-round tool-calling session that produces candidate claims.
//!
//! The session is a small state machine:
//!
//! ```text
//! AwaitingModel ──calls──▶ DispatchingTools ──outputs──▶ AwaitingModel
//!       │
//!       ├──final JSON──▶ Completed
//!       ├──budget spent─▶ Exhausted
//!       └──bad response─▶ Failed
//! ```
//!
//! Each transition consumes the transcript and hands a longer one to the
//! next state, so there is no loop-carried mutable bookkeeping.

use ai_client::{
    preview, DynTool, FunctionCallOutput, FunctionCallRequest, InputItem, ResponseRequest,
    ResponsesApi, StructuredOutput, ToolSpec, ToolWrapper,
};
use errata_core::PageFetcher;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::schema::ClaimList;
use super::tools::FetchUrlTool;
use crate::errors::InvestigationError;
use crate::investigations::ClaimDraft;

/// What the session investigates.
#[derive(Debug, Clone, Copy)]
pub struct InvestigationInput<'a> {
    pub content: &'a str,
    /// Claims from the parent investigation, re-verified on a re-check.
    pub prior_claims: &'a [ClaimDraft],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub claims: Vec<ClaimDraft>,
    pub rounds: u32,
    pub tool_calls: usize,
}

/// Accumulated input history. Grows by value; never edited in place.
#[derive(Debug, Clone, Default)]
struct Transcript {
    items: Vec<InputItem>,
    echoed_calls: BTreeSet<String>,
    answered: BTreeSet<String>,
    tool_calls: usize,
}

impl Transcript {
    fn start(first: InputItem) -> Self {
        Self {
            items: vec![first],
            ..Default::default()
        }
    }

    /// Echo a response's output items back as input for the next round.
    /// A function call is echoed only the first time its call id appears, so
    /// every echoed call pairs with exactly one output.
    fn with_response_output(mut self, output: &[Value]) -> Self {
        for item in output {
            match item.get("type").and_then(Value::as_str) {
                // Reasoning items cannot be replayed with storage disabled.
                Some("reasoning") => continue,
                Some("function_call") => {
                    let call_id = item.get("call_id").and_then(Value::as_str).unwrap_or_default();
                    if !self.echoed_calls.insert(call_id.to_string()) {
                        debug!(call_id, "Dropping repeated function call");
                        continue;
                    }
                }
                _ => {}
            }
            self.items.push(InputItem::Echo(item.clone()));
        }
        self
    }

    fn with_call_outputs(mut self, outputs: Vec<FunctionCallOutput>) -> Self {
        for output in outputs {
            self.answered.insert(output.call_id.clone());
            self.tool_calls += 1;
            self.items.push(InputItem::FunctionCallOutput(output));
        }
        self
    }

    /// Calls not yet answered, first occurrence of each call id only.
    fn pending(&self, calls: Vec<FunctionCallRequest>) -> Vec<FunctionCallRequest> {
        let mut seen = BTreeSet::new();
        calls
            .into_iter()
            .filter(|call| !self.answered.contains(&call.call_id))
            .filter(|call| seen.insert(call.call_id.clone()))
            .collect()
    }
}

enum SessionState {
    AwaitingModel {
        rounds: u32,
        transcript: Transcript,
    },
    DispatchingTools {
        rounds: u32,
        transcript: Transcript,
        calls: Vec<FunctionCallRequest>,
    },
    Completed {
        rounds: u32,
        tool_calls: usize,
        claims: ClaimList,
    },
    Exhausted {
        rounds: u32,
    },
    Failed(anyhow::Error),
}

pub struct InvestigationOrchestrator {
    model: String,
    max_rounds: u32,
    tools: Vec<Arc<dyn DynTool>>,
}

impl InvestigationOrchestrator {
    pub fn new(
        model: impl Into<String>,
        max_rounds: u32,
        fetcher: Arc<dyn PageFetcher>,
        fetch_preview_chars: usize,
    ) -> Self {
        Self {
            model: model.into(),
            max_rounds,
            tools: vec![Arc::new(ToolWrapper(FetchUrlTool::new(
                fetcher,
                fetch_preview_chars,
            )))],
        }
    }

    /// Run the session to a terminal state.
    pub async fn investigate(
        &self,
        api: &dyn ResponsesApi,
        instructions: &str,
        input: InvestigationInput<'_>,
    ) -> anyhow::Result<SessionOutcome> {
        let mut state = SessionState::AwaitingModel {
            rounds: 0,
            transcript: Transcript::start(InputItem::user(user_message(input))),
        };

        loop {
            state = match state {
                SessionState::AwaitingModel { rounds, transcript } => {
                    self.await_model(api, instructions, rounds, transcript).await
                }
                SessionState::DispatchingTools {
                    rounds,
                    transcript,
                    calls,
                } => self.dispatch_tools(rounds, transcript, calls).await,
                SessionState::Completed {
                    rounds,
                    tool_calls,
                    claims,
                } => {
                    info!(rounds, tool_calls, claims = claims.claims.len(), "Investigation session completed");
                    return Ok(SessionOutcome {
                        claims: claims.claims,
                        rounds,
                        tool_calls,
                    });
                }
                SessionState::Exhausted { rounds } => {
                    warn!(rounds, "Investigation tool round budget exhausted");
                    return Err(InvestigationError::RoundBudgetExhausted { rounds }.into());
                }
                SessionState::Failed(e) => return Err(e),
            };
        }
    }

    fn request(&self, instructions: &str, transcript: &Transcript) -> ResponseRequest {
        self.tools.iter().fold(
            ResponseRequest::new(&self.model)
                .instructions(instructions)
                .input(transcript.items.clone())
                .tool(ToolSpec::WebSearch)
                .text_format(ClaimList::text_format("claim_list")),
            |request, tool| request.tool(tool.definition().into_spec()),
        )
    }

    async fn await_model(
        &self,
        api: &dyn ResponsesApi,
        instructions: &str,
        rounds: u32,
        transcript: Transcript,
    ) -> SessionState {
        if rounds >= self.max_rounds {
            return SessionState::Exhausted { rounds };
        }
        let rounds = rounds + 1;

        let response = match api.create_response(&self.request(instructions, &transcript)).await {
            Ok(response) => response,
            Err(e) => return SessionState::Failed(e.into()),
        };

        if !response.is_completed() {
            return SessionState::Failed(
                InvestigationError::IncompleteResponse {
                    status: response.status().to_string(),
                    reason: response.incomplete_reason().map(str::to_string),
                    response_id: response.id.clone(),
                    output_len: response.output.len(),
                }
                .into(),
            );
        }

        let calls = transcript.pending(response.function_calls());
        let transcript = transcript.with_response_output(&response.output);
        debug!(round = rounds, response_id = %response.id, pending_calls = calls.len(), "Model round finished");

        if !calls.is_empty() {
            return SessionState::DispatchingTools {
                rounds,
                transcript,
                calls,
            };
        }

        let text = response.output_text();
        match parse_claims(&text) {
            Ok(claims) => SessionState::Completed {
                rounds,
                tool_calls: transcript.tool_calls,
                claims,
            },
            Err(e) => {
                warn!(response_id = %response.id, output = %preview(&text, 200), error = %e, "Investigation output rejected");
                SessionState::Failed(e.into())
            }
        }
    }

    async fn dispatch_tools(
        &self,
        rounds: u32,
        transcript: Transcript,
        calls: Vec<FunctionCallRequest>,
    ) -> SessionState {
        let outputs = join_all(calls.iter().map(|call| self.call_tool(call))).await;
        SessionState::AwaitingModel {
            rounds,
            transcript: transcript.with_call_outputs(outputs),
        }
    }

    /// Tool failures are reported to the model, not raised.
    async fn call_tool(&self, call: &FunctionCallRequest) -> FunctionCallOutput {
        let Some(tool) = self.tools.iter().find(|t| t.name() == call.name) else {
            warn!(tool = %call.name, call_id = %call.call_id, "Model called unknown tool");
            return error_output(&call.call_id, format!("unknown tool: {}", call.name));
        };

        debug!(tool = %call.name, call_id = %call.call_id, "Dispatching tool call");
        match tool.call_json(&call.arguments).await {
            Ok(value) => FunctionCallOutput::new(&call.call_id, value.to_string()),
            Err(e) => {
                debug!(tool = %call.name, call_id = %call.call_id, error = %e, "Tool call failed");
                error_output(&call.call_id, e.to_string())
            }
        }
    }
}

fn error_output(call_id: &str, message: String) -> FunctionCallOutput {
    FunctionCallOutput::new(call_id, serde_json::json!({ "error": message }).to_string())
}

fn user_message(input: InvestigationInput<'_>) -> String {
    let mut message = format!("Post to fact-check:\n\"\"\"\n{}\n\"\"\"", input.content);
    if !input.prior_claims.is_empty() {
        let prior = serde_json::to_string_pretty(input.prior_claims).unwrap_or_default();
        message.push_str("\n\nPrior findings to re-verify:\n");
        message.push_str(&prior);
    }
    message
}

fn parse_claims(text: &str) -> Result<ClaimList, InvestigationError> {
    if text.trim().is_empty() {
        return Err(InvestigationError::JsonParse(
            "model returned no output text".into(),
        ));
    }
    let list: ClaimList =
        serde_json::from_str(text).map_err(InvestigationError::from_output_parse)?;
    list.check_semantics()?;
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{classify, ErrorKind};
    use crate::testing::{
        completed_text, function_call_response, incomplete_response, sample_claim_json,
        ScriptedResponses, StaticPageFetcher,
    };
    use serde_json::json;

    fn orchestrator(max_rounds: u32) -> InvestigationOrchestrator {
        let fetcher = StaticPageFetcher::new().page("https://a.example/facts", "The moon is rock.");
        InvestigationOrchestrator::new("test-model", max_rounds, Arc::new(fetcher), 1_000)
    }

    fn input(content: &str) -> InvestigationInput<'_> {
        InvestigationInput {
            content,
            prior_claims: &[],
        }
    }

    fn items_of_type(request: &ResponseRequest, item_type: &str) -> Vec<Value> {
        serde_json::to_value(&request.input)
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .filter(|item| item["type"] == item_type)
            .cloned()
            .collect()
    }

    fn function_outputs(request: &ResponseRequest) -> Vec<Value> {
        items_of_type(request, "function_call_output")
    }

    fn call_ids(items: &[Value]) -> Vec<&str> {
        items.iter().map(|item| item["call_id"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn single_round_returns_claims() {
        let api = ScriptedResponses::new(vec![completed_text(&sample_claim_json())]);

        let outcome = orchestrator(4)
            .investigate(&api, "prompt", input("The moon is cheese."))
            .await
            .unwrap();

        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.claims.len(), 1);
        assert_eq!(outcome.claims[0].text, "The moon is made of cheese");

        let request = &api.requests()[0];
        assert_eq!(request.instructions.as_deref(), Some("prompt"));
        let tools = serde_json::to_value(&request.tools).unwrap();
        assert_eq!(tools[0]["type"], "web_search");
        assert_eq!(tools[1]["name"], "fetch_url");
    }

    #[tokio::test]
    async fn tool_calls_are_answered_once_per_call_id() {
        let api = ScriptedResponses::new(vec![
            function_call_response(&[
                ("call_a", "fetch_url", json!({"url": "https://a.example/facts"})),
                ("call_a", "fetch_url", json!({"url": "https://a.example/facts"})),
                ("call_b", "lookup_db", json!({})),
            ]),
            completed_text(&sample_claim_json()),
        ]);

        let outcome = orchestrator(4)
            .investigate(&api, "prompt", input("The moon is cheese."))
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.tool_calls, 2);

        let second = &api.requests()[1];
        let outputs = function_outputs(second);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0]["call_id"], "call_a");
        let page: Value = serde_json::from_str(outputs[0]["output"].as_str().unwrap()).unwrap();
        assert_eq!(page["content"], "The moon is rock.");

        assert_eq!(outputs[1]["call_id"], "call_b");
        assert!(outputs[1]["output"].as_str().unwrap().contains("unknown tool"));

        // The model's own function_call items are echoed ahead of the outputs,
        // once per call id.
        let echoed = serde_json::to_value(&second.input).unwrap();
        assert_eq!(echoed[0]["role"], "user");
        assert_eq!(echoed[1]["type"], "function_call");
        let calls = items_of_type(second, "function_call");
        assert_eq!(call_ids(&calls), vec!["call_a", "call_b"]);
    }

    #[tokio::test]
    async fn call_repeated_in_a_later_round_is_not_echoed_again() {
        let api = ScriptedResponses::new(vec![
            function_call_response(&[(
                "call_a",
                "fetch_url",
                json!({"url": "https://a.example/facts"}),
            )]),
            function_call_response(&[
                ("call_a", "fetch_url", json!({"url": "https://a.example/facts"})),
                ("call_c", "fetch_url", json!({"url": "https://a.example/facts"})),
            ]),
            completed_text(&sample_claim_json()),
        ]);

        let outcome = orchestrator(4)
            .investigate(&api, "prompt", input("The moon is cheese."))
            .await
            .unwrap();
        assert_eq!(outcome.rounds, 3);
        assert_eq!(outcome.tool_calls, 2);

        let third = &api.requests()[2];
        let calls = items_of_type(third, "function_call");
        let outputs = function_outputs(third);
        assert_eq!(call_ids(&calls), vec!["call_a", "call_c"]);
        assert_eq!(call_ids(&outputs), vec!["call_a", "call_c"]);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_to_the_model() {
        let api = ScriptedResponses::new(vec![
            function_call_response(&[(
                "call_a",
                "fetch_url",
                json!({"url": "http://10.0.0.1/admin"}),
            )]),
            completed_text(r#"{"claims":[]}"#),
        ]);

        let outcome = orchestrator(4)
            .investigate(&api, "prompt", input("Nothing wrong here."))
            .await
            .unwrap();
        assert!(outcome.claims.is_empty());

        let outputs = function_outputs(&api.requests()[1]);
        assert!(outputs[0]["output"].as_str().unwrap().contains("error"));
    }

    #[tokio::test]
    async fn round_budget_exhaustion_is_terminal() {
        let looping: Vec<_> = (0..5)
            .map(|i| {
                function_call_response(&[(
                    format!("call_{i}").as_str(),
                    "fetch_url",
                    json!({"url": "https://a.example/facts"}),
                )])
            })
            .collect();
        let api = ScriptedResponses::new(looping);

        let err = orchestrator(3)
            .investigate(&api, "prompt", input("x"))
            .await
            .unwrap_err();

        assert_eq!(api.requests().len(), 3);
        let classification = classify(&err);
        assert_eq!(classification.kind, ErrorKind::RoundBudgetExhausted);
        assert!(classification.is_terminal());
    }

    #[tokio::test]
    async fn incomplete_response_carries_diagnostics() {
        let api = ScriptedResponses::new(vec![incomplete_response("incomplete", "max_output_tokens")]);

        let err = orchestrator(4)
            .investigate(&api, "prompt", input("x"))
            .await
            .unwrap_err();

        match err.downcast_ref::<InvestigationError>() {
            Some(InvestigationError::IncompleteResponse {
                status,
                reason,
                response_id,
                ..
            }) => {
                assert_eq!(status, "incomplete");
                assert_eq!(reason.as_deref(), Some("max_output_tokens"));
                assert!(!response_id.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(classify(&err).is_terminal());
    }

    #[tokio::test]
    async fn malformed_output_is_classified_by_failure() {
        let cases = [
            ("{\"claims\": [", ErrorKind::JsonParse),
            ("{\"findings\": []}", ErrorKind::SchemaValidation),
            (
                r#"{"claims":[{"text":"x","context":"c","summary":"s","reasoning":"r","sources":[{"url":"nope","title":null,"snippet":null}]}]}"#,
                ErrorKind::StructuredOutputSemantic,
            ),
        ];

        for (text, kind) in cases {
            let api = ScriptedResponses::new(vec![completed_text(text)]);
            let err = orchestrator(4)
                .investigate(&api, "prompt", input("x"))
                .await
                .unwrap_err();
            assert_eq!(classify(&err).kind, kind, "{text}");
        }
    }

    #[tokio::test]
    async fn recheck_includes_prior_claims() {
        let prior: ClaimList = serde_json::from_str(&sample_claim_json()).unwrap();
        let api = ScriptedResponses::new(vec![completed_text(r#"{"claims":[]}"#)]);

        orchestrator(4)
            .investigate(
                &api,
                "prompt",
                InvestigationInput {
                    content: "The moon is cheese.",
                    prior_claims: &prior.claims,
                },
            )
            .await
            .unwrap();

        let first = serde_json::to_value(&api.requests()[0].input).unwrap();
        let message = first[0]["content"].as_str().unwrap();
        assert!(message.contains("Prior findings to re-verify"));
        assert!(message.contains("The moon is made of cheese"));
    }
}
