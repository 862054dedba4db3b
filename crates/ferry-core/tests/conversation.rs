//! Turn behavior with a scripted model and in-memory tools.

use ferry_core::{Conversation, ConversationEvent, MAX_TOOL_LOOPS};
use ferry_session::{History, HistoryEntry, InteractionLog};
use ferry_types::provider::{Provider, ProviderFuture};
use ferry_types::{
    ApiError, ContentBlock, CreateMessageRequest, CreateMessageResponse, FerryError, Role,
    StopReason, ToolDefinition, ToolError, ToolExecutor, ToolFuture, ToolOutput, Usage,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Scripted = Result<CreateMessageResponse, ApiError>;

/// Answers requests from a fixed script; when the script runs out it keeps
/// repeating `repeat` (or fails if there is none).
struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    repeat: Option<CreateMessageResponse>,
    requests: Mutex<Vec<CreateMessageRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn repeating(response: CreateMessageResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(response),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Provider for ScriptedProvider {
    fn create_message<'a>(&'a self, request: &'a CreateMessageRequest) -> ProviderFuture<'a> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            self.repeat
                .clone()
                .ok_or_else(|| ApiError::Network("script exhausted".into()))
        });
        Box::pin(async move { next })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Tools that answer after a per-name delay. `broken` always fails.
struct MockTools {
    delays_ms: Vec<(&'static str, u64)>,
    calls: Mutex<Vec<String>>,
}

impl MockTools {
    fn new(delays_ms: Vec<(&'static str, u64)>) -> Arc<Self> {
        Arc::new(Self {
            delays_ms,
            calls: Mutex::new(Vec::new()),
        })
    }
}

impl ToolExecutor for MockTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.delays_ms
            .iter()
            .map(|(name, _)| ToolDefinition {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({"type": "object"}),
            })
            .collect()
    }

    fn execute(&self, name: &str, input: serde_json::Value) -> ToolFuture<'_> {
        self.calls.lock().unwrap().push(name.to_string());
        let delay = self
            .delays_ms
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, ms)| *ms);
        let name = name.to_string();
        Box::pin(async move {
            let Some(delay) = delay else {
                return Err(ToolError::UnknownTool { name });
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if name == "broken" {
                return Err(ToolError::ExecutionFailed("boom".into()));
            }
            Ok(ToolOutput::text(format!("{name} says {input}")))
        })
    }
}

fn text_response(text: &str) -> Scripted {
    Ok(CreateMessageResponse {
        id: "msg_text".into(),
        role: Role::Assistant,
        content: vec![ContentBlock::Text { text: text.into() }],
        model: "test-model".into(),
        stop_reason: Some(StopReason::EndTurn),
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    })
}

fn tool_response(calls: &[(&str, &str)]) -> CreateMessageResponse {
    CreateMessageResponse {
        id: "msg_tools".into(),
        role: Role::Assistant,
        content: calls
            .iter()
            .map(|(id, name)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: json!({"format": "vgc"}),
            })
            .collect(),
        model: "test-model".into(),
        stop_reason: Some(StopReason::ToolUse),
        usage: Usage {
            input_tokens: 20,
            output_tokens: 8,
        },
    }
}

fn conversation(provider: Arc<ScriptedProvider>, tools: Arc<MockTools>) -> Conversation {
    Conversation::new(provider, tools, "test-model", 1024, InteractionLog::disabled())
}

fn tool_result_ids(history: &History) -> Vec<(String, bool)> {
    history
        .entries()
        .into_iter()
        .filter_map(|e| match e {
            HistoryEntry::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => Some((tool_use_id.to_string(), is_error)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn plain_answer_ends_the_turn() {
    let provider = ScriptedProvider::new(vec![text_response("Garchomp is a safe pick.")]);
    let tools = MockTools::new(vec![("suggest_team", 0)]);
    let mut convo = conversation(Arc::clone(&provider), tools);
    convo.set_system_prompt("You help build teams.");

    let mut history = History::new();
    let mut events = Vec::new();
    let answer = convo
        .send(&mut history, "who is good?", CancellationToken::new(), |e| {
            events.push(e)
        })
        .await
        .unwrap();

    assert_eq!(answer, "Garchomp is a safe pick.");
    assert_eq!(history.len(), 2);
    assert_eq!(history.usage().output_tokens, 5);
    assert_eq!(
        events,
        vec![
            ConversationEvent::Usage(Usage {
                input_tokens: 10,
                output_tokens: 5
            }),
            ConversationEvent::Text("Garchomp is a safe pick.".into()),
            ConversationEvent::Done,
        ]
    );

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests[0].system.as_deref(), Some("You help build teams."));
    assert_eq!(requests[0].tools.as_ref().unwrap()[0].name, "suggest_team");
}

#[tokio::test]
async fn results_follow_request_order_not_completion_order() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_response(&[("toolu_slow", "slow"), ("toolu_fast", "fast")])),
        text_response("done"),
    ]);
    let tools = MockTools::new(vec![("slow", 80), ("fast", 0)]);
    let convo = conversation(Arc::clone(&provider), tools);

    let mut history = History::new();
    let mut ends = Vec::new();
    convo
        .send(&mut history, "go", CancellationToken::new(), |e| {
            if let ConversationEvent::ToolEnd { id, .. } = e {
                ends.push(id);
            }
        })
        .await
        .unwrap();

    assert_eq!(
        tool_result_ids(&history),
        vec![("toolu_slow".to_string(), false), ("toolu_fast".to_string(), false)]
    );
    assert_eq!(ends, vec!["toolu_slow", "toolu_fast"]);
    // The second request replays the tool round to the model.
    assert_eq!(provider.request_count(), 2);
    assert_eq!(provider.requests.lock().unwrap()[1].messages.len(), 3);
}

#[tokio::test]
async fn tool_failures_become_error_results() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_response(&[("toolu_1", "broken"), ("toolu_2", "missing")])),
        text_response("Sorry, the tools failed."),
    ]);
    let tools = MockTools::new(vec![("broken", 0)]);
    let convo = conversation(provider, tools);

    let mut history = History::new();
    let answer = convo
        .send(&mut history, "go", CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(answer, "Sorry, the tools failed.");
    assert_eq!(
        tool_result_ids(&history),
        vec![("toolu_1".to_string(), true), ("toolu_2".to_string(), true)]
    );
    let text = match &history.messages()[2].content[1] {
        ContentBlock::ToolResult { content, .. } => format!("{content:?}"),
        other => panic!("Expected tool result, got {other:?}"),
    };
    assert!(text.contains("Unknown tool: missing"), "{text}");
}

#[tokio::test]
async fn model_failure_keeps_only_the_user_message() {
    let provider = ScriptedProvider::new(vec![
        Ok(tool_response(&[("toolu_1", "suggest_team")])),
        Err(ApiError::Overloaded),
        text_response("Try Incineroar."),
    ]);
    let tools = MockTools::new(vec![("suggest_team", 0)]);
    let convo = conversation(provider, tools);

    let mut history = History::new();
    let mut events = Vec::new();
    let err = convo
        .send(&mut history, "suggest a team", CancellationToken::new(), |e| {
            events.push(e)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::Api(ApiError::Overloaded)));
    assert_eq!(history.len(), 1);
    assert!(history.awaiting_reply());
    assert!(matches!(events.last(), Some(ConversationEvent::Error(_))));

    let answer = convo
        .retry(&mut history, CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(answer, "Try Incineroar.");
    assert_eq!(history.len(), 2);

    let again = convo
        .retry(&mut history, CancellationToken::new(), |_| {})
        .await;
    assert!(matches!(again, Err(FerryError::NothingToRetry)));
}

#[tokio::test]
async fn malformed_response_is_reported() {
    let mut bad = tool_response(&[]);
    bad.stop_reason = Some(StopReason::ToolUse);
    bad.content = vec![ContentBlock::Text {
        text: "calling...".into(),
    }];
    let provider = ScriptedProvider::new(vec![Ok(bad)]);
    let convo = conversation(provider, MockTools::new(vec![]));

    let mut history = History::new();
    let err = convo
        .send(&mut history, "hi", CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FerryError::Api(ApiError::MalformedResponse(_))
    ));
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn tool_loop_is_bounded() {
    let provider = ScriptedProvider::repeating(tool_response(&[("toolu_n", "suggest_team")]));
    let tools = MockTools::new(vec![("suggest_team", 0)]);
    let convo = conversation(Arc::clone(&provider), Arc::clone(&tools));

    let mut history = History::new();
    let err = convo
        .send(&mut history, "loop forever", CancellationToken::new(), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::ToolLoopLimit { limit } if limit == MAX_TOOL_LOOPS));
    assert_eq!(provider.request_count(), MAX_TOOL_LOOPS);
    assert_eq!(tools.calls.lock().unwrap().len(), MAX_TOOL_LOOPS);
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn cancel_during_tools_rolls_back() {
    let provider = ScriptedProvider::new(vec![Ok(tool_response(&[("toolu_1", "slow")]))]);
    let tools = MockTools::new(vec![("slow", 10_000)]);
    let convo = conversation(provider, tools);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut history = History::new();
    let mut events = Vec::new();
    let err = convo
        .send(&mut history, "go", cancel, |e| events.push(e))
        .await
        .unwrap_err();

    assert!(matches!(err, FerryError::Cancelled));
    assert_eq!(events.last(), Some(&ConversationEvent::Cancelled));
    assert_eq!(history.len(), 1);
    assert!(history.awaiting_reply());
}
