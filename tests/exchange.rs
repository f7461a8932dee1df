use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use harmony_chat::conversation::{
    ContentKind, Conversation, ConversationOptions, EndToken, Role, StreamChunk, ToolContext, Turn,
};
use harmony_chat::core::{ChatEngine, EngineSettings, InMemoryStore, TerminalPolicy};
use harmony_chat::harmony::{self, Classifier, ClassifierEvent, HistoryCompiler};
use harmony_chat::providers::ScriptedProvider;
use harmony_chat::tools::{ParameterType, Tool, ToolDescriptor, ToolError, ToolParameter, ToolRegistry};

#[derive(Debug, Default, Deserialize)]
struct WeatherParams {
    location: String,
}

/// Always sunny, wherever you ask
struct SunnyWeather;

#[async_trait]
impl Tool for SunnyWeather {
    type Params = WeatherParams;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("get_current_weather", "Gets the current weather in the provided location.")
            .with_parameter(ToolParameter::new("location", ParameterType::String, "City"))
    }

    async fn invoke(&self, params: WeatherParams) -> Result<String, ToolError> {
        assert!(!params.location.is_empty());
        Ok(r#"{"sunny":true}"#.to_string())
    }
}

const TOOL_CALL: &str = r#"<|channel|>commentary to=functions.get_current_weather <|constrain|>json<|message|>{"location":"SF"}<|call|>"#;
const FINAL: &str = "<|channel|>final<|message|>It is sunny.<|return|>";

fn engine(provider: &Arc<ScriptedProvider>) -> ChatEngine {
    engine_with(provider, EngineSettings::default())
}

fn engine_with(provider: &Arc<ScriptedProvider>, settings: EngineSettings) -> ChatEngine {
    let mut tools = ToolRegistry::new();
    tools.register(SunnyWeather);
    ChatEngine::new(provider.clone(), Arc::new(tools), Arc::new(InMemoryStore::new())).with_settings(settings)
}

fn options() -> ConversationOptions {
    ConversationOptions::default().with_tools(["get_current_weather"])
}

fn conversation(prompt: &str) -> Conversation {
    let mut conversation = Conversation::new("test");
    conversation.add_user(prompt);
    conversation
}

/// Run an exchange to completion and collect every chunk it sent.
async fn exchange(engine: &ChatEngine, conversation: &mut Conversation) -> Vec<StreamChunk> {
    let (tx, mut rx) = mpsc::channel(256);
    engine
        .run_exchange(conversation, &options(), &tx, CancellationToken::new())
        .await;
    drop(tx);

    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

fn assert_single_done(chunks: &[StreamChunk]) {
    assert_eq!(chunks.iter().filter(|c| c.is_done).count(), 1);
    assert!(chunks.last().unwrap().is_done);
}

fn visible(chunks: &[StreamChunk]) -> Vec<(ContentKind, &str)> {
    chunks
        .iter()
        .filter(|c| !c.is_done)
        .map(|c| (c.content_kind, c.chunk.as_str()))
        .collect()
}

#[tokio::test]
async fn final_answer_streams_and_closes_the_exchange() {
    let provider = Arc::new(ScriptedProvider::new().respond("<|start|>assistant<|channel|>final<|message|>Hello<|end|>"));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(visible(&chunks), vec![(ContentKind::Answer, "Hello")]);
    assert_single_done(&chunks);

    assert_eq!(conversation.len(), 2);
    let answer = conversation.last().unwrap();
    assert_eq!(answer.role, Role::Assistant);
    assert_eq!(answer.channel.as_deref(), Some("final"));
    assert_eq!(answer.content.as_deref(), Some("Hello<|return|>"));
    assert_eq!(answer.end_token, EndToken::Return);
    assert_eq!(answer.content_kind, ContentKind::Answer);
    assert_eq!(chunks[0].turn_id, Some(answer.id));
    assert_eq!(provider.requests(), 1);
}

#[tokio::test]
async fn tool_call_is_dispatched_and_fed_back() {
    let provider = Arc::new(ScriptedProvider::new().respond(TOOL_CALL).respond(FINAL));
    let engine = engine(&provider);
    let mut conversation = conversation("Weather in SF?");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 2);
    assert_eq!(conversation.len(), 4);

    let call = conversation.turns[1].tool_context.as_ref().unwrap();
    assert_eq!(conversation.turns[1].role, Role::Tool);
    assert_eq!(conversation.turns[1].end_token, EndToken::Call);
    assert!(!call.is_result);
    assert_eq!(call.tool_name, "get_current_weather");
    assert_eq!(call.content, r#"{"location":"SF"}"#);

    let result = conversation.turns[2].tool_context.as_ref().unwrap();
    assert!(result.is_result);
    assert_eq!(result.call_id, call.call_id);
    assert_eq!(result.content, r#"{"sunny":true}"#);

    assert_eq!(conversation.turns[3].content.as_deref(), Some("It is sunny.<|return|>"));

    // the result goes back to the model without a wrapping user turn
    let second_prompt = &provider.prompts()[1];
    assert!(second_prompt.ends_with(
        r#"<|start|>functions.get_current_weather to=assistant<|channel|>commentary<|message|>{"sunny":true}<|start|>assistant"#
    ));

    assert_eq!(
        visible(&chunks),
        vec![
            (ContentKind::Reasoning, r#"{"location":"SF"}"#),
            (ContentKind::Reasoning, r#"{"sunny":true}"#),
            (ContentKind::Answer, "It is sunny."),
        ]
    );
    assert_single_done(&chunks);
}

#[tokio::test]
async fn malformed_arguments_become_an_error_turn() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond("<|channel|>commentary to=functions.get_current_weather <|constrain|>json<|message|>{not json<|call|>")
            .respond(FINAL),
    );
    let engine = engine(&provider);
    let mut conversation = conversation("Weather?");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 2);
    let error = &conversation.turns[2];
    assert_eq!(error.role, Role::System);
    assert_eq!(error.channel.as_deref(), Some("commentary"));
    assert!(error.content.as_deref().unwrap().contains("Failed to deserialize parameters"));
    assert_eq!(conversation.turns[3].end_token, EndToken::Return);
    assert_single_done(&chunks);
}

#[tokio::test]
async fn unknown_channel_is_kept_but_not_forwarded() {
    let provider = Arc::new(ScriptedProvider::new().respond(
        "<|channel|>weird-channel<|message|>hmm<|end|><|start|>assistant<|channel|>final<|message|>Done<|return|>",
    ));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(conversation.len(), 3);
    let odd = &conversation.turns[1];
    assert_eq!(odd.role, Role::Assistant);
    assert_eq!(odd.channel.as_deref(), Some("weird-channel"));
    assert_eq!(odd.content.as_deref(), Some("hmm"));
    assert_eq!(odd.end_token, EndToken::End);
    assert!(odd.tool_context.is_none());

    assert_eq!(visible(&chunks), vec![(ContentKind::Answer, "Done")]);
    assert_eq!(provider.requests(), 1);
}

#[tokio::test]
async fn nothing_runs_after_the_final_turn() {
    let provider = Arc::new(ScriptedProvider::new().respond(&format!("{FINAL}<|start|>assistant{TOOL_CALL}")));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(conversation.len(), 2);
    assert!(conversation.turns.iter().all(|t| t.tool_context.is_none()));
    assert_eq!(provider.requests(), 1);
    assert_single_done(&chunks);
}

#[tokio::test]
async fn consecutive_tool_calls_interleave_with_outcomes() {
    const N: usize = 3;
    let mut provider = ScriptedProvider::new();
    for _ in 0..N {
        provider = provider.respond(TOOL_CALL);
    }
    let provider = Arc::new(provider.respond(FINAL));
    let engine = engine(&provider);
    let mut conversation = conversation("Weather?");

    let chunks = exchange(&engine, &mut conversation).await;

    let produced = &conversation.turns[1..];
    assert_eq!(produced.len(), 2 * N + 1);
    for pair in produced[..2 * N].chunks(2) {
        let call = pair[0].tool_context.as_ref().unwrap();
        let outcome = pair[1].tool_context.as_ref().unwrap();
        assert!(!call.is_result);
        assert!(outcome.is_result);
        assert_eq!(call.call_id, outcome.call_id);
    }
    assert_eq!(produced[2 * N].role, Role::Assistant);
    assert_eq!(provider.requests(), N + 1);
    assert_single_done(&chunks);
}

#[tokio::test]
async fn tool_rounds_are_bounded() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond(TOOL_CALL)
            .respond(TOOL_CALL)
            .respond(TOOL_CALL),
    );
    let settings = EngineSettings {
        max_tool_rounds: 2,
        ..EngineSettings::default()
    };
    let engine = engine_with(&provider, settings);
    let mut conversation = conversation("Weather?");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 3);
    let notice = conversation.last().unwrap();
    assert_eq!(notice.role, Role::System);
    assert!(notice.content.as_deref().unwrap().starts_with("Stopped after 2 tool calls"));
    assert!(visible(&chunks).last().unwrap().1.starts_with("Stopped after"));
    assert_single_done(&chunks);
}

#[tokio::test]
async fn stream_ending_inside_a_tool_call_dispatches_it() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond(r#"<|channel|>commentary to=functions.get_current_weather <|constrain|>json<|message|>{"location":"SF"}"#)
            .respond(FINAL),
    );
    let engine = engine(&provider);
    let mut conversation = conversation("Weather?");

    exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 2);
    assert!(conversation.turns[2].tool_context.as_ref().unwrap().is_result);
}

#[tokio::test]
async fn call_without_tool_name_reports_malformed_name() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond("<|channel|>commentary<|message|>{}<|call|>")
            .respond(FINAL),
    );
    let engine = engine(&provider);
    let mut conversation = conversation("Weather?");

    exchange(&engine, &mut conversation).await;

    assert_eq!(conversation.turns[1].tool_context.as_ref().unwrap().tool_name, "unknown");
    assert_eq!(
        conversation.turns[2].content.as_deref(),
        Some("Tool name \"unknown\" was incorrect, not a tool, or couldn't be parsed.")
    );
    assert_eq!(provider.requests(), 2);
}

#[tokio::test]
async fn analysis_can_end_the_exchange_under_any_non_tool() {
    let wire = "<|channel|>analysis<|message|>Thinking<|end|>";

    let provider = Arc::new(ScriptedProvider::new().respond(wire));
    let settings = EngineSettings {
        terminal_policy: TerminalPolicy::AnyNonTool,
        ..EngineSettings::default()
    };
    let engine = engine_with(&provider, settings);
    let mut conversation = conversation("Hi");
    exchange(&engine, &mut conversation).await;
    assert_eq!(conversation.last().unwrap().end_token, EndToken::Return);

    // under the default policy the analysis turn is kept and reading goes on
    let provider = Arc::new(ScriptedProvider::new().respond(&format!("{wire}<|start|>assistant{FINAL}")));
    let engine = crate::engine(&provider);
    let mut conversation = crate::conversation("Hi");
    let chunks = exchange(&engine, &mut conversation).await;
    assert_eq!(conversation.len(), 3);
    assert_eq!(conversation.turns[1].end_token, EndToken::End);
    assert_eq!(
        visible(&chunks),
        vec![(ContentKind::Reasoning, "Thinking"), (ContentKind::Answer, "It is sunny.")]
    );
}

#[tokio::test]
async fn stream_closing_after_analysis_asks_again() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond("<|channel|>analysis<|message|>Thinking<|end|>")
            .respond(FINAL),
    );
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 2);
    assert_eq!(conversation.len(), 3);
    assert_eq!(conversation.turns[1].channel.as_deref(), Some("analysis"));
    assert_eq!(conversation.turns[1].end_token, EndToken::End);
    assert_eq!(conversation.last().unwrap().content.as_deref(), Some("It is sunny.<|return|>"));

    // the follow-up request continues the analysis turn
    assert!(provider.prompts()[1].ends_with("<|channel|>analysis<|message|>Thinking<|start|>assistant"));

    assert_eq!(
        visible(&chunks),
        vec![(ContentKind::Reasoning, "Thinking"), (ContentKind::Answer, "It is sunny.")]
    );
    assert_single_done(&chunks);
}

#[tokio::test]
async fn stream_closing_after_unknown_channel_asks_again() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond("<|channel|>weird-channel<|message|>hmm<|end|>")
            .respond(FINAL),
    );
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 2);
    assert_eq!(conversation.len(), 3);
    assert_eq!(conversation.turns[1].content.as_deref(), Some("hmm"));
    assert_eq!(conversation.last().unwrap().end_token, EndToken::Return);
    assert_eq!(visible(&chunks), vec![(ContentKind::Answer, "It is sunny.")]);
    assert_single_done(&chunks);
}

#[tokio::test]
async fn follow_up_requests_are_bounded() {
    let analysis = "<|channel|>analysis<|message|>Still thinking<|end|>";
    let provider = Arc::new(
        ScriptedProvider::new()
            .respond(analysis)
            .respond(analysis)
            .respond(FINAL),
    );
    let settings = EngineSettings {
        max_continuations: 1,
        ..EngineSettings::default()
    };
    let engine = engine_with(&provider, settings);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 2);
    let notice = conversation.last().unwrap();
    assert_eq!(notice.role, Role::System);
    assert!(notice
        .content
        .as_deref()
        .unwrap()
        .starts_with("Stopped after 1 follow-up requests"));
    assert_single_done(&chunks);
}

#[tokio::test]
async fn empty_stream_is_not_retried() {
    let provider = Arc::new(ScriptedProvider::new().respond("").respond(FINAL));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(provider.requests(), 1);
    assert_eq!(conversation.len(), 1);
    assert!(visible(&chunks).is_empty());
    assert_single_done(&chunks);
}

#[tokio::test]
async fn coalesced_fragments_are_split_on_control_tokens() {
    let provider = Arc::new(
        ScriptedProvider::new().respond_fragments(["<|channel|>final<|message|>Hel", "lo<|end|>"]),
    );
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(
        visible(&chunks),
        vec![(ContentKind::Answer, "Hel"), (ContentKind::Answer, "lo")]
    );
    assert_eq!(conversation.last().unwrap().content.as_deref(), Some("Hello<|return|>"));
    assert_single_done(&chunks);
}

#[tokio::test]
async fn transport_failure_ends_with_an_error_chunk() {
    let provider = Arc::new(ScriptedProvider::new().refuse("connection refused"));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(conversation.len(), 1);
    let shown = visible(&chunks);
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].0, ContentKind::Answer);
    assert!(shown[0].1.starts_with("Error: "));
    assert!(shown[0].1.contains("connection refused"));
    assert_single_done(&chunks);
}

#[tokio::test]
async fn mid_stream_failure_keeps_partial_content() {
    let provider = Arc::new(ScriptedProvider::new().fail_after("<|channel|>final<|message|>Hal", "reset by peer"));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let chunks = exchange(&engine, &mut conversation).await;

    assert_eq!(conversation.last().unwrap().content.as_deref(), Some("Hal<|return|>"));
    let shown = visible(&chunks);
    assert_eq!(shown[0], (ContentKind::Answer, "Hal"));
    assert!(shown[1].1.contains("reset by peer"));
    assert_single_done(&chunks);
}

#[tokio::test]
async fn cancellation_commits_partial_message() {
    let provider = Arc::new(ScriptedProvider::new().stall_after("<|channel|>final<|message|>Hel"));
    let engine = engine(&provider);
    let mut conversation = conversation("Hi");

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<StreamChunk>(8);
    let consumer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(chunk) = rx.recv().await {
                if !chunk.is_done {
                    cancel.cancel();
                }
                seen.push(chunk);
            }
            seen
        })
    };

    engine.run_exchange(&mut conversation, &options(), &tx, cancel).await;
    drop(tx);
    let chunks = consumer.await.unwrap();

    assert_eq!(visible(&chunks), vec![(ContentKind::Answer, "Hel")]);
    assert_single_done(&chunks);
    assert_eq!(conversation.last().unwrap().content.as_deref(), Some("Hel<|return|>"));
    assert_eq!(provider.requests(), 1);
}

#[test]
fn compiled_history_replays_through_the_classifier() {
    let mut conversation = Conversation::new("roundtrip");
    conversation.add_user("Weather in SF?");
    conversation.push(
        Turn::assistant(Uuid::new_v4(), "Need the weather tool.", ContentKind::Reasoning).with_channel("analysis"),
    );
    conversation.push(Turn::tool(
        Uuid::new_v4(),
        ToolContext {
            call_id: "call-1".into(),
            tool_name: "get_current_weather".into(),
            content: r#"{"location":"SF"}"#.into(),
            is_result: false,
        },
    ));
    conversation.push(Turn::tool(
        Uuid::new_v4(),
        ToolContext {
            call_id: "call-1".into(),
            tool_name: "get_current_weather".into(),
            content: r#"{"sunny":true}"#.into(),
            is_result: true,
        },
    ));
    conversation.push(
        Turn::assistant(Uuid::new_v4(), "It is sunny.<|return|>", ContentKind::Answer)
            .with_channel("final")
            .with_end_token(EndToken::Return),
    );

    let mut tools = ToolRegistry::new();
    tools.register(SunnyWeather);
    let text = assert_ok!(HistoryCompiler::new(&tools).compile(&conversation, &options(), false));

    let mut classifier = Classifier::new();
    let replayed: Vec<(Role, Option<String>, String)> = harmony::fragments(&text)
        .into_iter()
        .filter_map(|fragment| match classifier.feed(fragment) {
            Some(ClassifierEvent::MessageEnd(message)) => {
                Some((message.header.role, message.header.channel, message.content))
            }
            _ => None,
        })
        .skip(2) // system and developer preamble
        .collect();

    let expected = vec![
        (Role::User, None, "Weather in SF?".to_string()),
        (Role::Assistant, Some("analysis".to_string()), "Need the weather tool.".to_string()),
        (
            Role::Assistant,
            Some("commentary to=functions.get_current_weather <|constrain|>json".to_string()),
            r#"{"location":"SF"}"#.to_string(),
        ),
        (
            Role::Tool,
            Some("commentary".to_string()),
            r#"{"sunny":true}"#.to_string(),
        ),
        (Role::Assistant, Some("final".to_string()), "It is sunny.".to_string()),
    ];
    assert_eq!(replayed, expected);
}

