#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use daycare_config::{ConfigLoader, DaycareConfig};
    use daycare_core::{
        DaycareError, Event, EventBus, HistoryRecord, ProviderSettings, RlmLimits, RlmStartRecord,
        RlmToolCallRecord, Snapshot, Tool, ToolCall, ToolExecutionContext, ToolResolver,
        ToolResult,
    };
    use daycare_history::{HistoryStore, InboxStore, MemoryStore, PersistedInboxEntry, SqliteStore};
    use daycare_llm::mock::MockResponse;
    use daycare_llm::{InferenceRouter, MockProvider, ProviderRegistry};
    use daycare_rlm::{
        InProcessWorkerFactory, Interpreter, Progress, RlmExecutor, RlmWorkers, ScriptedInterpreter,
        StartRequest,
    };
    use daycare_runtime::*;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;
    use tokio::sync::oneshot;

    // ── Fixtures ───────────────────────────────────────────────

    /// `echo(text)` returns `{"echoed": text}`; `ping()` steers the agent.
    #[derive(Default)]
    struct TestTools {
        calls: Mutex<Vec<ToolCall>>,
        inbox: OnceLock<Arc<AgentInbox>>,
    }

    impl TestTools {
        fn called(&self) -> Vec<String> {
            self.calls
                .lock()
                .iter()
                .map(|c| format!("{}:{}", c.tool_name, c.arguments))
                .collect()
        }
    }

    #[async_trait]
    impl ToolResolver for TestTools {
        fn list_tools(&self) -> Vec<Tool> {
            vec![
                Tool {
                    name: "echo".into(),
                    description: "Echo text back.".into(),
                    parameters: json!({
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                        "required": ["text"]
                    }),
                },
                Tool {
                    name: "ping".into(),
                    description: "Ping.".into(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
            ]
        }

        async fn execute(
            &self,
            call: &ToolCall,
            _context: &ToolExecutionContext,
        ) -> daycare_core::Result<ToolResult> {
            self.calls.lock().push(call.clone());
            match call.tool_name.as_str() {
                "echo" => {
                    let text = call.arguments["text"].as_str().unwrap_or_default().to_string();
                    Ok(ToolResult::success(&call.id, text.clone()).with_data(json!({ "echoed": text })))
                }
                "ping" => {
                    if let Some(inbox) = self.inbox.get() {
                        inbox.steer(Steering {
                            text: "stop now".into(),
                            origin: Some("user".into()),
                        });
                    }
                    Ok(ToolResult::success(&call.id, "pong"))
                }
                other => Err(DaycareError::ToolNotFound(other.into())),
            }
        }
    }

    /// History that fails the next append of each listed record kind once.
    #[derive(Default)]
    struct FlakyHistory {
        inner: MemoryStore,
        fail_next: Mutex<Vec<&'static str>>,
    }

    impl FlakyHistory {
        fn failing(kinds: &[&'static str]) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_next: Mutex::new(kinds.to_vec()),
            }
        }
    }

    #[async_trait]
    impl HistoryStore for FlakyHistory {
        async fn append(&self, agent_id: &str, record: &HistoryRecord) -> daycare_core::Result<()> {
            {
                let mut fail_next = self.fail_next.lock();
                if let Some(pos) = fail_next.iter().position(|k| *k == record.kind()) {
                    fail_next.remove(pos);
                    return Err(DaycareError::History("disk full".into()));
                }
            }
            self.inner.append(agent_id, record).await
        }

        async fn read_raw(&self, agent_id: &str) -> daycare_core::Result<Vec<HistoryRecord>> {
            self.inner.read_raw(agent_id).await
        }
    }

    struct Harness {
        agent: Agent,
        history: Arc<dyn HistoryStore>,
        provider: Arc<MockProvider>,
        tools: Arc<TestTools>,
        events: EventBus,
    }

    fn mock_settings() -> ProviderSettings {
        ProviderSettings {
            id: "mock".into(),
            model: "mock-model".into(),
            options: Value::Null,
        }
    }

    fn harness_with(
        history: Arc<dyn HistoryStore>,
        inbox_store: Option<Arc<dyn InboxStore>>,
        provider: MockProvider,
    ) -> Harness {
        let provider = Arc::new(provider);
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider.clone());
        let router = Arc::new(InferenceRouter::new(registry, vec![mock_settings()]));
        let tools = Arc::new(TestTools::default());
        let factory = Arc::new(InProcessWorkerFactory::new(Arc::new(ScriptedInterpreter::new())));
        let executor = Arc::new(RlmExecutor::new(
            Arc::new(RlmWorkers::new(factory)),
            RlmLimits::default(),
        ));
        let events = EventBus::new(256);
        let deps = AgentDeps {
            history: history.clone(),
            inbox_store,
            router,
            tools: tools.clone(),
            executor,
            context_builder: Arc::new(HistoryContextBuilder::new(Some("You are a test agent.".into()))),
            events: events.clone(),
        };
        let agent = Agent::new("agent-1", deps, AgentOptions::default());
        let _ = tools.inbox.set(agent.inbox().clone());
        Harness {
            agent,
            history,
            provider,
            tools,
            events,
        }
    }

    fn harness(provider: MockProvider) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with(store.clone(), Some(store), provider)
    }

    async fn history(h: &Harness) -> Vec<HistoryRecord> {
        h.history.read_all("agent-1").await.unwrap()
    }

    fn kinds(records: &[HistoryRecord]) -> Vec<&'static str> {
        records.iter().map(|r| r.kind()).collect()
    }

    fn user_texts(records: &[HistoryRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::UserMessage { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn completes(records: &[HistoryRecord]) -> Vec<daycare_core::RlmCompleteRecord> {
        records
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::RlmComplete(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn notes(records: &[HistoryRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|r| match r {
                HistoryRecord::Note { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn user(at: i64, text: &str) -> HistoryRecord {
        HistoryRecord::UserMessage {
            at,
            text: text.into(),
            files: vec![],
            message_id: None,
        }
    }

    fn assistant(at: i64, text: &str) -> HistoryRecord {
        HistoryRecord::AssistantMessage {
            at,
            text: text.into(),
            tool_calls: vec![],
            provider: None,
            model: None,
        }
    }

    fn assistant_calls(at: i64, calls: &[(&str, &str)]) -> HistoryRecord {
        HistoryRecord::AssistantMessage {
            at,
            text: String::new(),
            tool_calls: calls
                .iter()
                .map(|(id, code)| ToolCall {
                    id: (*id).into(),
                    tool_name: "run_python".into(),
                    arguments: json!({ "code": code }),
                })
                .collect(),
            provider: None,
            model: None,
        }
    }

    /// A reply that asks for scripts through native `run_python` tool calls.
    fn run_python_calls(calls: &[(&str, &str)]) -> MockResponse {
        MockResponse {
            tool_calls: calls
                .iter()
                .map(|(id, code)| ToolCall {
                    id: (*id).into(),
                    tool_name: "run_python".into(),
                    arguments: json!({ "code": code }),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn start(at: i64, id: &str, code: &str) -> RlmStartRecord {
        RlmStartRecord {
            at,
            tool_call_id: id.into(),
            code: code.into(),
            preamble: String::new(),
        }
    }

    fn tool_call(at: i64, id: &str, snapshot: Snapshot, count: u32) -> RlmToolCallRecord {
        RlmToolCallRecord {
            at,
            tool_call_id: id.into(),
            snapshot,
            function_name: "echo".into(),
            args: vec![],
            kwargs: Default::default(),
            tool_args: Value::Null,
            print_output: vec![],
            tool_call_count: count,
        }
    }

    fn complete(at: i64, id: &str) -> HistoryRecord {
        HistoryRecord::RlmComplete(daycare_core::RlmCompleteRecord {
            at,
            tool_call_id: id.into(),
            output: "ok".into(),
            print_output: vec![],
            tool_call_count: 1,
            is_error: false,
            error: None,
        })
    }

    /// Snapshot of `code` paused at its first host call, as a real worker would produce.
    fn paused_snapshot(code: &str) -> Snapshot {
        let progress = ScriptedInterpreter::new()
            .start(StartRequest {
                code: code.into(),
                preamble: String::new(),
                external_functions: vec!["echo".into()],
                limits: RlmLimits::default(),
            })
            .unwrap();
        match progress {
            Progress::Suspended { snapshot, .. } => snapshot,
            other => panic!("expected a paused script, got {other:?}"),
        }
    }

    /// `(tool_call_id, content)` of every tool result in the `n`th model request.
    fn request_tool_results(provider: &MockProvider, n: usize) -> Vec<(String, String)> {
        let requests = provider.recorded_requests();
        let requests = requests.lock();
        requests[n]
            .context
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|c| match c {
                daycare_core::MessageContent::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => Some((tool_call_id.clone(), content.clone())),
                _ => None,
            })
            .collect()
    }

    async fn wait_until_stopped(agent: &Agent) {
        for _ in 0..200 {
            if !agent.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent loop did not stop");
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    // ── Inbox ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_inbox_order_with_front_and_restore() {
        let inbox = AgentInbox::new();
        inbox.attach();
        inbox.post(InboxItem::message("a"), None, PostOptions::default());
        inbox.post(
            InboxItem::SystemMessage {
                text: "b".into(),
                origin: None,
            },
            None,
            PostOptions::default(),
        );
        inbox.post(InboxItem::Reset { message: None }, None, PostOptions::front());
        inbox.post(InboxItem::Restore, None, PostOptions::default());

        let mut order = Vec::new();
        while inbox.size() > 0 {
            order.push(inbox.next().await.unwrap().item.kind());
        }
        assert_eq!(order, vec!["restore", "reset", "message", "system_message"]);
    }

    #[tokio::test]
    async fn test_inbox_merges_messages_and_completes_every_poster() {
        let inbox = AgentInbox::new();
        inbox.attach();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let first = inbox.post(
            InboxItem::Message {
                text: "one".into(),
                files: vec![],
                context: MessageContext {
                    message_id: Some("m1".into()),
                    source: None,
                },
            },
            Some(tx1),
            PostOptions::default(),
        );
        let merged = inbox.post(
            InboxItem::Message {
                text: "two".into(),
                files: vec![],
                context: MessageContext {
                    message_id: Some("m2".into()),
                    source: None,
                },
            },
            Some(tx2),
            PostOptions::default(),
        );

        assert_eq!(inbox.size(), 1);
        assert_eq!(merged.id, first.id);
        let entry = inbox.next().await.unwrap();
        let InboxItem::Message { text, context, .. } = &entry.item else {
            panic!("expected a message");
        };
        assert_eq!(text, "one\ntwo");
        assert_eq!(context.message_id.as_deref(), Some("m2"));
        assert_eq!(entry.completions.len(), 2);

        let result = InboxResult {
            response_text: Some("hi".into()),
            skipped: false,
        };
        entry.complete(Ok(result.clone()));
        assert_eq!(rx1.await.unwrap().unwrap(), result);
        assert_eq!(rx2.await.unwrap().unwrap(), result);
    }

    #[tokio::test]
    async fn test_inbox_does_not_merge_across_boundaries() {
        let inbox = AgentInbox::new();
        inbox.post(
            InboxItem::message("replayed"),
            None,
            PostOptions::replay("row-1", 10),
        );
        inbox.post(InboxItem::message("after replay"), None, PostOptions::default());
        inbox.post(
            InboxItem::message("kept apart"),
            None,
            PostOptions {
                merge: Some(false),
                ..Default::default()
            },
        );
        inbox.post(InboxItem::Reset { message: None }, None, PostOptions::default());
        inbox.post(InboxItem::message("after reset"), None, PostOptions::default());

        let pending = inbox.list_pending();
        assert_eq!(pending.len(), 5);
        assert_eq!(pending[0].id, "row-1");
        assert_eq!(pending[0].posted_at, 10);
        assert!(!pending[0].mergeable);
        assert_eq!(inbox.drain_pending().len(), 5);
        assert_eq!(inbox.size(), 0);
    }

    #[test]
    fn test_inbox_steering_last_write_wins() {
        let inbox = AgentInbox::new();
        assert!(!inbox.has_steering());
        inbox.steer(Steering {
            text: "first".into(),
            origin: None,
        });
        inbox.steer(Steering {
            text: "second".into(),
            origin: Some("user".into()),
        });
        assert!(inbox.has_steering());
        assert_eq!(inbox.consume_steering().unwrap().text, "second");
        assert!(inbox.consume_steering().is_none());
        assert!(!inbox.has_steering());
    }

    #[tokio::test]
    async fn test_inbox_next_wakes_on_post_and_ends_on_detach() {
        let inbox = Arc::new(AgentInbox::new());
        inbox.attach();

        let waiter = tokio::spawn({
            let inbox = inbox.clone();
            async move { inbox.next().await.map(|e| e.item.kind()) }
        });
        tokio::task::yield_now().await;
        inbox.post(InboxItem::message("hello"), None, PostOptions::default());
        assert_eq!(waiter.await.unwrap(), Some("message"));

        let waiter = tokio::spawn({
            let inbox = inbox.clone();
            async move { inbox.next().await.is_none() }
        });
        tokio::task::yield_now().await;
        inbox.detach();
        assert!(waiter.await.unwrap());

        inbox.attach();
        inbox.post(InboxItem::message("again"), None, PostOptions::default());
        assert!(inbox.next().await.is_some());
    }

    // ── Pending phase ──────────────────────────────────────────

    #[test]
    fn test_pending_phase_none_when_every_chain_closed() {
        assert_eq!(resolve_pending_phase(&[]), None);
        let records = vec![
            user(1, "hi"),
            assistant(2, "<run_python>return 1</run_python>"),
            HistoryRecord::RlmStart(start(3, "c1", "return 1")),
            complete(4, "c1"),
            assistant(5, "done"),
        ];
        assert_eq!(resolve_pending_phase(&records), None);
    }

    #[test]
    fn test_pending_phase_resumes_latest_checkpoint() {
        let code = "call echo [\"a\"]\ncall echo [\"b\"]";
        let records = vec![
            user(1, "go"),
            assistant(
                2,
                &format!("<run_python>{code}</run_python>\n<run_python>return 2</run_python>"),
            ),
            HistoryRecord::RlmStart(start(3, "c1", code)),
            HistoryRecord::RlmToolCall(tool_call(4, "c1", Snapshot::new(b"first".to_vec()), 0)),
            HistoryRecord::RlmToolResult {
                at: 5,
                tool_call_id: "c1".into(),
                function_name: "echo".into(),
                result: "a".into(),
                is_error: false,
            },
            HistoryRecord::RlmToolCall(tool_call(6, "c1", Snapshot::new(b"second".to_vec()), 1)),
        ];

        let Some(PendingPhase::ToolCall {
            start,
            snapshot,
            blocks,
            block_index,
            assistant_at,
            ..
        }) = resolve_pending_phase(&records)
        else {
            panic!("expected a tool_call phase");
        };
        assert_eq!(start.tool_call_id, "c1");
        assert_eq!(snapshot.snapshot.as_bytes(), b"second");
        assert_eq!(snapshot.tool_call_count, 1);
        assert_eq!(blocks.len(), 2);
        assert_eq!(block_index, 0);
        assert_eq!(assistant_at, 2);
    }

    #[test]
    fn test_pending_phase_matches_block_by_tool_call_id() {
        let records = vec![
            assistant_calls(1, &[("c1", "return 1"), ("c2", "call echo [\"x\"]")]),
            HistoryRecord::RlmStart(start(2, "c1", "return 1")),
            complete(3, "c1"),
            HistoryRecord::RlmStart(start(4, "c2", "call echo [\"x\"]")),
            HistoryRecord::RlmToolCall(tool_call(5, "c2", Snapshot::new(b"s".to_vec()), 0)),
        ];
        let Some(PendingPhase::ToolCall { block_index, blocks, .. }) = resolve_pending_phase(&records) else {
            panic!("expected a tool_call phase");
        };
        assert_eq!(block_index, 1);
        assert_eq!(blocks[1].tool_call_id.as_deref(), Some("c2"));
    }

    #[test]
    fn test_pending_phase_uses_rewritten_text() {
        let records = vec![
            assistant(1, "<run_python>call echo [\"x\"]</run_python> trailing"),
            HistoryRecord::AssistantRewrite {
                at: 2,
                assistant_at: 1,
                text: "<run_python>call echo [\"x\"]</run_python>".into(),
                reason: FAILURE_TRIM_REASON.into(),
            },
            HistoryRecord::RlmStart(start(3, "c1", "call echo [\"x\"]")),
            HistoryRecord::RlmToolCall(tool_call(4, "c1", Snapshot::new(b"s".to_vec()), 0)),
        ];
        let Some(PendingPhase::ToolCall { history_text, .. }) = resolve_pending_phase(&records) else {
            panic!("expected a tool_call phase");
        };
        assert_eq!(history_text, "<run_python>call echo [\"x\"]</run_python>");
    }

    #[test]
    fn test_pending_phase_start_without_checkpoint_is_an_error() {
        let records = vec![
            assistant(1, "<run_python>call echo [\"x\"]</run_python>"),
            HistoryRecord::RlmStart(start(2, "c1", "call echo [\"x\"]")),
        ];
        let phase = resolve_pending_phase(&records).unwrap();
        assert_eq!(phase.kind(), "recovery_error");
        let PendingPhase::RecoveryError {
            start,
            message,
            blocks,
            block_index,
            assistant_at,
            ..
        } = phase
        else {
            unreachable!();
        };
        assert_eq!(start.tool_call_id, "c1");
        assert_eq!(message, RESTARTED_BEFORE_TOOL_CALL);
        assert_eq!(blocks.len(), 1);
        assert_eq!(block_index, 0);
        assert_eq!(assistant_at, 1);
    }

    #[test]
    fn test_pending_phase_unstarted_blocks() {
        let records = vec![
            user(1, "go"),
            assistant(2, "<run_python>return 1</run_python><run_python>return 2</run_python>"),
        ];
        let phase = resolve_pending_phase(&records).unwrap();
        let PendingPhase::ScriptStart {
            blocks,
            block_index,
            assistant_at,
            ..
        } = &phase
        else {
            panic!("expected a script_start phase");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(*block_index, 0);
        assert_eq!(*assistant_at, 2);

        // Pure: asking again gives the same answer.
        assert_eq!(resolve_pending_phase(&records), Some(phase.clone()));

        let mut started = records.clone();
        started.push(HistoryRecord::RlmStart(start(3, "c1", "return 1")));
        started.push(complete(4, "c1"));
        assert_eq!(resolve_pending_phase(&started), None);
    }

    #[test]
    fn test_pending_phase_serializes_with_type_tag() {
        let records = vec![assistant(1, "<run_python>return 1</run_python>")];
        let value = serde_json::to_value(resolve_pending_phase(&records).unwrap()).unwrap();
        assert_eq!(value["type"], "script_start");
        assert_eq!(value["blocks"][0]["code"], "return 1");
    }

    // ── Context ────────────────────────────────────────────────

    #[test]
    fn test_context_starts_after_reset_and_applies_rewrites() {
        let records = vec![
            user(1, "forgotten"),
            HistoryRecord::Reset { at: 2, message: None },
            user(3, "hello"),
            assistant(4, "<run_python>return 1</run_python> extra"),
            HistoryRecord::AssistantRewrite {
                at: 5,
                assistant_at: 4,
                text: "<run_python>return 1</run_python>".into(),
                reason: FAILURE_TRIM_REASON.into(),
            },
            HistoryRecord::RlmStart(start(6, "c1", "return 1")),
            complete(7, "c1"),
            HistoryRecord::Note {
                at: 8,
                text: "a note".into(),
            },
        ];
        let context = HistoryContextBuilder::new(Some("System.".into())).build(&records, "# preamble");

        assert_eq!(context.system.as_deref(), Some("System.\n\n# preamble"));
        assert_eq!(context.tools, vec![run_python_tool()]);
        let texts: Vec<String> = context.messages.iter().map(|m| m.text_content()).collect();
        assert_eq!(
            texts,
            vec![
                "hello".to_string(),
                "<run_python>return 1</run_python>".to_string(),
                "<python_result>\nOutput: ok\n</python_result>".to_string(),
                "a note".to_string(),
            ]
        );
    }

    #[test]
    fn test_context_native_calls_get_tool_results() {
        let records = vec![
            assistant_calls(1, &[("c1", "return 1")]),
            HistoryRecord::RlmStart(start(2, "c1", "return 1")),
            HistoryRecord::RlmComplete(daycare_core::RlmCompleteRecord {
                at: 3,
                tool_call_id: "c1".into(),
                output: String::new(),
                print_output: vec!["line".into()],
                tool_call_count: 0,
                is_error: true,
                error: Some("Python runtime error.\nboom".into()),
            }),
        ];
        let context = HistoryContextBuilder::default().build(&records, "");
        assert_eq!(context.system, None);
        let last = context.messages.last().unwrap();
        assert_eq!(last.role, daycare_core::Role::Tool);
        assert_eq!(
            last.content[0],
            daycare_core::MessageContent::ToolResult {
                tool_call_id: "c1".into(),
                content: "Printed:\nline\n\nPython execution failed.\nPython runtime error.\nboom".into(),
                is_error: true,
            }
        );
    }

    // ── Agent turns ────────────────────────────────────────────

    #[tokio::test]
    async fn test_agent_runs_echo_script_end_to_end() {
        let h = harness(
            MockProvider::new("mock")
                .with_response("Let me check.\n<run_python>call echo [\"x\"]</run_python>")
                .with_response("The tool said x."),
        );
        let mut events = h.events.subscribe();
        h.agent.start().await.unwrap();

        let result = h.agent.post_and_wait(InboxItem::message("say x")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("The tool said x."));
        assert!(!result.skipped);

        let records = history(&h).await;
        assert_eq!(
            kinds(&records),
            vec![
                "user_message",
                "assistant_message",
                "rlm_start",
                "rlm_tool_call",
                "rlm_tool_result",
                "rlm_complete",
                "assistant_message",
            ]
        );
        let done = &completes(&records)[0];
        assert_eq!(done.output, r#"{"echoed":"x"}"#);
        assert_eq!(done.tool_call_count, 1);
        assert!(!done.is_error);
        assert_eq!(h.tools.called(), vec![r#"echo:{"text":"x"}"#.to_string()]);

        let requests = h.provider.recorded_requests();
        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].stop, vec!["</run_python>".to_string()]);
        let system = requests[0].context.system.clone().unwrap();
        assert!(system.contains("def echo(text: str) -> str:"));
        let second = requests[1].context.messages.last().unwrap().text_content();
        assert!(second.contains(r#"Output: {"echoed":"x"}"#));
        drop(requests);

        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(e, Event::InferenceAttempt { provider, .. } if provider == "mock")));
        assert!(events.iter().any(|e| matches!(e, Event::ScriptToolCall { function_name, .. } if function_name == "echo")));
        assert!(events.iter().any(|e| matches!(e, Event::TurnCompleted { .. })));

        h.agent.stop().await;
        assert!(!h.agent.is_running());
    }

    #[tokio::test]
    async fn test_agent_runs_only_first_tag_block() {
        let h = harness(
            MockProvider::new("mock")
                .with_response(
                    "<run_python>call echo [\"a\"]</run_python> and then <run_python>call echo [\"b\"]</run_python>",
                )
                .with_response("ok"),
        );
        h.agent.start().await.unwrap();
        h.agent.post_and_wait(InboxItem::message("go")).await.unwrap();

        assert_eq!(h.tools.called(), vec![r#"echo:{"text":"a"}"#.to_string()]);
        let records = history(&h).await;
        let HistoryRecord::AssistantMessage { text, .. } = &records[1] else {
            panic!("expected the assistant message");
        };
        assert_eq!(text, "<run_python>call echo [\"a\"]</run_python>");
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_blocks_run_one_chain_at_a_time() {
        let h = harness(MockProvider::new("mock"));
        h.provider.queue_response(run_python_calls(&[
            ("c1", "call echo [\"a\"]"),
            ("c2", "call echo [\"b\"]"),
        ]));
        h.provider.queue_response(MockResponse::text("both done"));
        h.agent.start().await.unwrap();
        let result = h.agent.post_and_wait(InboxItem::message("two blocks")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("both done"));
        assert_eq!(
            h.tools.called(),
            vec![r#"echo:{"text":"a"}"#.to_string(), r#"echo:{"text":"b"}"#.to_string()]
        );

        let records = history(&h).await;
        let mut open: Option<String> = None;
        let mut chains = Vec::new();
        for record in &records {
            match record {
                HistoryRecord::RlmStart(s) => {
                    assert!(open.is_none(), "a chain started while another was open");
                    open = Some(s.tool_call_id.clone());
                    chains.push(s.tool_call_id.clone());
                }
                HistoryRecord::RlmComplete(c) => {
                    assert_eq!(open.take().as_deref(), Some(c.tool_call_id.as_str()));
                }
                other => {
                    if let Some(id) = other.rlm_tool_call_id() {
                        assert_eq!(open.as_deref(), Some(id));
                    }
                }
            }
        }
        assert_eq!(chains, vec!["c1".to_string(), "c2".to_string()]);
        assert!(open.is_none());

        // Native calls are answered with tool-role messages.
        let requests = h.provider.recorded_requests();
        let last = requests.lock().last().unwrap().context.messages.clone();
        let tool_results: Vec<_> = last
            .iter()
            .filter(|m| m.role == daycare_core::Role::Tool)
            .collect();
        assert_eq!(tool_results.len(), 2);
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_failed_tool_call_block_skips_the_rest() {
        let h = harness(MockProvider::new("mock"));
        h.provider
            .queue_response(run_python_calls(&[("c1", "raise boom"), ("c2", "return 2")]));
        h.provider.queue_response(MockResponse::text("I see the error."));
        h.agent.start().await.unwrap();
        let result = h.agent.post_and_wait(InboxItem::message("go")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("I see the error."));

        let records = history(&h).await;
        let starts = records
            .iter()
            .filter(|r| matches!(r, HistoryRecord::RlmStart(_)))
            .count();
        assert_eq!(starts, 1);

        let failed = &completes(&records)[0];
        assert_eq!(failed.tool_call_id, "c1");
        assert!(failed.is_error);
        assert_eq!(failed.error.as_deref(), Some("Python runtime error.\nboom"));

        let skipped = records
            .iter()
            .find_map(|r| match r {
                HistoryRecord::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                    ..
                } => Some((tool_call_id.clone(), content.clone(), *is_error)),
                _ => None,
            })
            .unwrap();
        assert_eq!(skipped.0, "c2");
        assert!(skipped.1.starts_with("Not executed"));
        assert!(skipped.2);

        let requests = h.provider.recorded_requests();
        let second = requests.lock()[1].context.messages.clone();
        let failure = second
            .iter()
            .flat_map(|m| m.content.iter())
            .find_map(|c| match c {
                daycare_core::MessageContent::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } if tool_call_id == "c1" => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(failure.starts_with("Python execution failed."));
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_steering_settles_remaining_tool_calls() {
        let h = harness(MockProvider::new("mock"));
        h.provider.queue_response(run_python_calls(&[
            ("c1", "call ping"),
            ("c2", "call echo [\"b\"]"),
        ]));
        h.provider.queue_response(MockResponse::text("Stopped."));
        h.agent.start().await.unwrap();
        let result = h.agent.post_and_wait(InboxItem::message("go")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("Stopped."));
        assert_eq!(h.tools.called(), vec!["ping:{}".to_string()]);

        let results = request_tool_results(&h.provider, 1);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(results[0].1.contains("Message from user: stop now"));
        assert_eq!(results[1].1, NOT_EXECUTED_STEERED);
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_skip_settles_remaining_tool_calls() {
        let h = harness(MockProvider::new("mock"));
        h.provider
            .queue_response(run_python_calls(&[("c1", "call skip"), ("c2", "return 2")]));
        h.provider.queue_response(MockResponse::text("Back again."));
        h.agent.start().await.unwrap();
        let result = h.agent.post_and_wait(InboxItem::message("ignore me")).await.unwrap();
        assert!(result.skipped);

        h.agent.post_and_wait(InboxItem::message("now answer")).await.unwrap();
        let results = request_tool_results(&h.provider, 1);
        assert_eq!(
            results,
            vec![
                ("c1".to_string(), "Output: Turn skipped".to_string()),
                ("c2".to_string(), NOT_EXECUTED_SKIPPED.to_string()),
            ]
        );
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_failed_block_trims_assistant_text() {
        // Written by a model that ignored the stop sequence; recovered at start.
        let store = Arc::new(MemoryStore::new());
        store.append("agent-1", &user(1, "go")).await.unwrap();
        store
            .append(
                "agent-1",
                &assistant(2, "<run_python>raise boom</run_python>\nNext:\n<run_python>return 2</run_python>"),
            )
            .await
            .unwrap();
        let h = harness_with(
            store.clone(),
            None,
            MockProvider::new("mock").with_response("I see the error."),
        );
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        let records = history(&h).await;
        let starts = records
            .iter()
            .filter(|r| matches!(r, HistoryRecord::RlmStart(_)))
            .count();
        assert_eq!(starts, 1);
        assert!(completes(&records)[0].is_error);

        let rewrite = records
            .iter()
            .find_map(|r| match r {
                HistoryRecord::AssistantRewrite {
                    assistant_at,
                    text,
                    reason,
                    ..
                } => Some((*assistant_at, text.clone(), reason.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(rewrite.0, 2);
        assert_eq!(rewrite.1, "<run_python>raise boom</run_python>");
        assert_eq!(rewrite.2, FAILURE_TRIM_REASON);

        let requests = h.provider.recorded_requests();
        let texts: Vec<String> = requests.lock()[0]
            .context
            .messages
            .iter()
            .map(|m| m.text_content())
            .collect();
        assert!(texts.contains(&"<run_python>raise boom</run_python>".to_string()));
        assert!(!texts.iter().any(|t| t.contains("return 2")));
        assert!(texts.iter().any(|t| t.contains("Python execution failed.")));
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_skip_ends_turn_without_reply() {
        let h = harness(MockProvider::new("mock").with_response("<run_python>call skip</run_python>"));
        h.agent.start().await.unwrap();
        let result = h.agent.post_and_wait(InboxItem::message("ignore me")).await.unwrap();
        assert!(result.skipped);
        assert_eq!(result.response_text, None);
        assert_eq!(h.provider.recorded_requests().lock().len(), 1);
        assert_eq!(completes(&history(&h).await)[0].output, "Turn skipped");
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_steering_stops_block_at_checkpoint() {
        let h = harness(
            MockProvider::new("mock")
                .with_response("<run_python>call ping\ncall echo [\"never\"]</run_python>")
                .with_response("Stopping as asked."),
        );
        h.agent.start().await.unwrap();
        let result = h.agent.post_and_wait(InboxItem::message("go")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("Stopping as asked."));

        assert_eq!(h.tools.called(), vec!["ping:{}".to_string()]);
        assert!(!h.agent.inbox().has_steering());
        let report = &completes(&history(&h).await)[0].output;
        assert!(report.starts_with("<python_result>"));
        assert!(report.contains("Message from user: stop now"));
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_model_error_records_note_and_fails_poster() {
        let h = harness(MockProvider::new("mock").with_error("overloaded"));
        let mut events = h.events.subscribe();
        h.agent.start().await.unwrap();

        let err = h.agent.post_and_wait(InboxItem::message("hi")).await.unwrap_err();
        assert!(matches!(*err, DaycareError::ModelCall { .. }));
        let records = history(&h).await;
        assert_eq!(notes(&records), vec!["Inference failed.".to_string()]);
        assert!(
            drain_events(&mut events)
                .iter()
                .any(|e| matches!(e, Event::AgentError { .. }))
        );

        // The agent keeps serving after a failed turn.
        h.provider.queue_response(MockResponse::text("back"));
        let result = h.agent.post_and_wait(InboxItem::message("again")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("back"));
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_without_providers_reports_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(
            store.clone(),
            None,
            MockProvider::new("mock").with_client_error("no credentials"),
        );
        h.agent.start().await.unwrap();
        let err = h.agent.post_and_wait(InboxItem::message("hi")).await.unwrap_err();
        assert!(matches!(*err, DaycareError::ProviderUnavailable { .. }));
        assert_eq!(notes(&history(&h).await), vec!["Inference failed.".to_string()]);
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_reset_and_system_message() {
        let h = harness(MockProvider::new("mock").with_response("noted"));
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset {
                message: Some("fresh start".into()),
            })
            .await
            .unwrap();
        h.agent
            .post_and_wait(InboxItem::SystemMessage {
                text: "nightly check".into(),
                origin: Some("cron".into()),
            })
            .await
            .unwrap();

        let records = history(&h).await;
        assert_eq!(records[0].kind(), "reset");
        assert_eq!(
            user_texts(&records),
            vec![system_message_text("nightly check", Some("cron"))]
        );
        assert_eq!(h.agent.start().await.unwrap_err().to_string(), "agent error: agent agent-1 is already running");
        h.agent.stop().await;
    }

    // ── Recovery ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_agent_resumes_paused_script_after_restart() {
        let code = "try call echo [\"a\"]\ncall echo [\"b\"]";
        let store = Arc::new(MemoryStore::new());
        for record in [
            user(1, "do both"),
            assistant(2, &format!("<run_python>{code}</run_python>")),
            HistoryRecord::RlmStart(start(3, "run-1", code)),
            HistoryRecord::RlmToolCall(tool_call(4, "run-1", paused_snapshot(code), 0)),
        ] {
            store.append("agent-1", &record).await.unwrap();
        }

        let h = harness_with(
            store.clone(),
            Some(store.clone()),
            MockProvider::new("mock").with_response("Recovered."),
        );
        let mut events = h.events.subscribe();
        h.agent.start().await.unwrap();
        // Queued behind the restore, so it returns once recovery is done.
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        // The interrupted call is not repeated.
        assert_eq!(h.tools.called(), vec![r#"echo:{"text":"b"}"#.to_string()]);

        let records = history(&h).await;
        let resumed = &completes(&records)[0];
        assert_eq!(resumed.tool_call_id, "run-1");
        assert_eq!(resumed.output, r#"{"echoed":"b"}"#);
        assert_eq!(resumed.tool_call_count, 1);
        assert_eq!(
            notes(&records),
            vec![r#"RLM execution completed after restart. Output: {"echoed":"b"}"#.to_string()]
        );
        assert_eq!(h.provider.recorded_requests().lock().len(), 1);
        assert_eq!(resolve_pending_phase(&records), None);
        assert!(
            drain_events(&mut events)
                .iter()
                .any(|e| matches!(e, Event::AgentRestored { phase, .. } if phase == "tool_call"))
        );
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_restore_with_uncaught_restart_error() {
        let code = "call echo [\"a\"]";
        let store = Arc::new(MemoryStore::new());
        for record in [
            assistant(1, &format!("<run_python>{code}</run_python>")),
            HistoryRecord::RlmStart(start(2, "run-1", code)),
            HistoryRecord::RlmToolCall(tool_call(3, "run-1", paused_snapshot(code), 0)),
        ] {
            store.append("agent-1", &record).await.unwrap();
        }
        let h = harness_with(store.clone(), None, MockProvider::new("mock").with_response("ok"));
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        let records = history(&h).await;
        let failed = &completes(&records)[0];
        assert!(failed.is_error);
        assert!(failed.error.as_deref().unwrap().contains("Process was restarted"));
        assert!(notes(&records)[0].starts_with("RLM execution failed after restart."));
        assert!(h.tools.called().is_empty());
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_runs_unstarted_blocks_after_restart() {
        let store = Arc::new(MemoryStore::new());
        store.append("agent-1", &user(1, "go")).await.unwrap();
        store
            .append("agent-1", &assistant(2, "<run_python>call echo [\"late\"]</run_python>"))
            .await
            .unwrap();
        let h = harness_with(store.clone(), None, MockProvider::new("mock").with_response("ok"));
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        assert_eq!(h.tools.called(), vec![r#"echo:{"text":"late"}"#.to_string()]);
        assert_eq!(completes(&history(&h).await)[0].output, r#"{"echoed":"late"}"#);
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_durable_inbox_drops_in_flight_entry_and_replays_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("daycare.db")).unwrap());
        for record in [
            user(1, "wait for it"),
            assistant(2, "<run_python>call echo [\"x\"]</run_python>"),
            HistoryRecord::RlmStart(start(3, "run-1", "call echo [\"x\"]")),
        ] {
            store.append("agent-1", &record).await.unwrap();
        }
        for (id, posted_at, text) in [("in-flight", 1, "wait for it"), ("queued", 5, "next one")] {
            store
                .save(
                    "agent-1",
                    &PersistedInboxEntry {
                        id: id.into(),
                        posted_at,
                        mergeable: true,
                        in_flight: id == "in-flight",
                        item: serde_json::to_value(InboxItem::message(text)).unwrap(),
                    },
                )
                .await
                .unwrap();
        }

        let h = harness_with(
            store.clone(),
            Some(store.clone()),
            MockProvider::new("mock")
                .with_response("after restart")
                .with_response("handled next"),
        );
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        let records = history(&h).await;
        let failed = &completes(&records)[0];
        assert_eq!(failed.tool_call_id, "run-1");
        assert!(failed.is_error);
        assert_eq!(failed.error.as_deref(), Some(RESTARTED_BEFORE_TOOL_CALL));
        assert_eq!(
            user_texts(&records),
            vec!["wait for it".to_string(), "next one".to_string()]
        );
        assert_eq!(h.provider.recorded_requests().lock().len(), 2);
        assert!(store.list("agent-1").await.unwrap().is_empty());
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_recovery_error_settles_remaining_tool_calls() {
        let store = Arc::new(MemoryStore::new());
        for record in [
            user(1, "go"),
            assistant_calls(2, &[("c1", "call echo [\"a\"]"), ("c2", "call echo [\"b\"]")]),
            HistoryRecord::RlmStart(start(3, "c1", "call echo [\"a\"]")),
        ] {
            store.append("agent-1", &record).await.unwrap();
        }
        let h = harness_with(store.clone(), None, MockProvider::new("mock").with_response("ok"));
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        assert!(h.tools.called().is_empty());
        let results = request_tool_results(&h.provider, 0);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!(results[0].1.contains(RESTARTED_BEFORE_TOOL_CALL));
        assert_eq!(results[1].1, NOT_EXECUTED_FAILED);
        assert_eq!(resolve_pending_phase(&history(&h).await), None);
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_durable_inbox_keeps_unhandled_entry_after_second_crash() {
        // The first crash's in-flight row is already gone; "second" was never handled.
        let code = "try call echo [\"a\"]";
        let store = Arc::new(MemoryStore::new());
        for record in [
            user(1, "first"),
            assistant(2, &format!("<run_python>{code}</run_python>")),
            HistoryRecord::RlmStart(start(3, "run-1", code)),
            HistoryRecord::RlmToolCall(tool_call(4, "run-1", paused_snapshot(code), 0)),
        ] {
            store.append("agent-1", &record).await.unwrap();
        }
        store
            .save(
                "agent-1",
                &PersistedInboxEntry {
                    id: "second".into(),
                    posted_at: 5,
                    mergeable: true,
                    in_flight: false,
                    item: serde_json::to_value(InboxItem::message("second")).unwrap(),
                },
            )
            .await
            .unwrap();

        let h = harness_with(
            store.clone(),
            Some(store.clone()),
            MockProvider::new("mock")
                .with_response("recovered")
                .with_response("handled second"),
        );
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        let records = history(&h).await;
        assert_eq!(user_texts(&records), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(h.provider.recorded_requests().lock().len(), 2);
        assert!(store.list("agent-1").await.unwrap().is_empty());
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_entry_posted_before_start_is_handled_once() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(
            store.clone(),
            Some(store.clone()),
            MockProvider::new("mock").with_response("handled"),
        );
        // Queued in memory and in the store; start must not queue it a second time.
        let pending = h.agent.post(InboxItem::message("once"), PostOptions::default()).await;
        h.agent.start().await.unwrap();
        pending.await.unwrap().unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        assert_eq!(user_texts(&history(&h).await), vec!["once".to_string()]);
        assert_eq!(h.provider.recorded_requests().lock().len(), 1);
        assert!(store.list("agent-1").await.unwrap().is_empty());
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_posted_entries_survive_until_handled() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store.clone(), Some(store.clone()), MockProvider::new("mock"));

        // Not started: the entry waits in the inbox and in the store.
        let _pending = h.agent.post(InboxItem::message("later"), PostOptions::default()).await;
        let stored = store.list("agent-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].item["type"], "message");
        assert_eq!(stored[0].item["text"], "later");
        drop(h);

        // A fresh agent over the same store replays and handles it.
        let h = harness_with(
            store.clone(),
            Some(store.clone()),
            MockProvider::new("mock").with_response("handled"),
        );
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();
        assert_eq!(user_texts(&history(&h).await), vec!["later".to_string()]);
        assert!(store.list("agent-1").await.unwrap().is_empty());
        h.agent.stop().await;
    }

    // ── History failures ───────────────────────────────────────

    #[tokio::test]
    async fn test_agent_closes_chain_when_checkpoint_write_fails() {
        let history = Arc::new(FlakyHistory::failing(&["rlm_tool_result"]));
        let h = harness_with(
            history.clone(),
            None,
            MockProvider::new("mock").with_response("<run_python>call echo [\"x\"]</run_python>"),
        );
        h.agent.start().await.unwrap();
        let err = h.agent.post_and_wait(InboxItem::message("go")).await.unwrap_err();
        assert!(matches!(*err, DaycareError::History(_)));

        let records = h.history.read_all("agent-1").await.unwrap();
        let closed = &completes(&records)[0];
        assert!(closed.is_error);
        assert_eq!(closed.error.as_deref(), Some("history error: disk full"));
        assert_eq!(resolve_pending_phase(&records), None);

        // Still serving, and the next turn starts from a closed history.
        h.provider.queue_response(MockResponse::text("still here"));
        let result = h.agent.post_and_wait(InboxItem::message("again")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("still here"));
        h.agent.stop().await;
    }

    #[tokio::test]
    async fn test_agent_stops_when_chain_cannot_be_closed() {
        let history = Arc::new(FlakyHistory::failing(&["rlm_tool_result", "rlm_complete"]));
        let inbox = Arc::new(MemoryStore::new());
        let h = harness_with(
            history.clone(),
            Some(inbox.clone()),
            MockProvider::new("mock").with_response("<run_python>call echo [\"x\"]</run_python>"),
        );
        h.agent.start().await.unwrap();
        let err = h.agent.post_and_wait(InboxItem::message("go")).await.unwrap_err();
        assert!(matches!(*err, DaycareError::ChainLeftOpen { .. }));
        wait_until_stopped(&h.agent).await;

        // The open chain and the flagged entry are left for the next start.
        let records = h.history.read_all("agent-1").await.unwrap();
        assert_eq!(resolve_pending_phase(&records).map(|p| p.kind()), Some("tool_call"));
        let stored = inbox.list("agent-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].in_flight);
        h.agent.stop().await;
        drop(h);

        let h = harness_with(
            history.clone(),
            Some(inbox.clone()),
            MockProvider::new("mock").with_response("recovered"),
        );
        h.agent.start().await.unwrap();
        h.agent
            .post_and_wait(InboxItem::Reset { message: None })
            .await
            .unwrap();

        let records = h.history.read_all("agent-1").await.unwrap();
        assert_eq!(resolve_pending_phase(&records), None);
        assert_eq!(user_texts(&records), vec!["go".to_string()]);
        assert!(notes(&records)[0].starts_with("RLM execution failed after restart."));
        assert!(inbox.list("agent-1").await.unwrap().is_empty());
        h.agent.stop().await;
    }

    // ── Configuration ──────────────────────────────────────────

    fn write_providers(path: &std::path::Path, ids: &[&str]) {
        let body: String = ids
            .iter()
            .map(|id| format!("[[providers]]\nid = \"{id}\"\nmodel = \"{id}-model\"\n\n"))
            .collect();
        std::fs::write(path, format!("[agent]\nsystem_prompt = \"Configured.\"\n\n{body}")).unwrap();
    }

    fn provider_ids(router: &InferenceRouter) -> Vec<String> {
        router.providers().into_iter().map(|p| p.id).collect()
    }

    #[tokio::test]
    async fn test_deps_from_config_follow_provider_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daycare.toml");
        write_providers(&path, &["first", "second"]);
        let loader = ConfigLoader::load(Some(path.as_path())).unwrap();

        let registry = Arc::new(ProviderRegistry::new());
        let first = Arc::new(MockProvider::new("first").with_response("from first"));
        let second = Arc::new(
            MockProvider::new("second")
                .with_response("from second")
                .with_response("unused"),
        );
        registry.register(first.clone());
        registry.register(second.clone());

        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(InProcessWorkerFactory::new(Arc::new(ScriptedInterpreter::new())));
        let deps = AgentDeps::from_config_with_workers(
            &loader,
            factory,
            registry,
            Arc::new(TestTools::default()),
            store.clone(),
        )
        .with_inbox_store(store.clone());
        assert_eq!(provider_ids(&deps.router), vec!["first", "second"]);
        let follower = follow_config_reloads(&loader, deps.router.clone());

        let agent = Agent::new("agent-1", deps.clone(), AgentOptions::from(&loader.get().agent));
        agent.start().await.unwrap();
        let result = agent.post_and_wait(InboxItem::message("hi")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("from first"));
        let system = first.recorded_requests().lock()[0].context.system.clone().unwrap();
        assert!(system.starts_with("Configured."));

        write_providers(&path, &["second", "first"]);
        loader.reload().await.unwrap();
        for _ in 0..200 {
            if provider_ids(&deps.router) == vec!["second", "first"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider_ids(&deps.router), vec!["second", "first"]);

        let result = agent.post_and_wait(InboxItem::message("again")).await.unwrap();
        assert_eq!(result.response_text.as_deref(), Some("from second"));
        agent.stop().await;
        follower.abort();
    }

    #[tokio::test]
    async fn test_deps_from_config_hold_the_reload_lock_during_completions() {
        let config = DaycareConfig {
            providers: vec![mock_settings()],
            ..Default::default()
        };
        let loader = ConfigLoader::from_config(config, "unused.toml".into());
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(MockProvider::new("mock").with_response("done")));
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(InProcessWorkerFactory::new(Arc::new(ScriptedInterpreter::new())));
        let deps = AgentDeps::from_config_with_workers(
            &loader,
            factory,
            registry,
            Arc::new(TestTools::default()),
            store,
        );
        assert_eq!(
            deps.executor.workers().request_timeout(),
            Duration::from_secs(60)
        );

        let lock = loader.reload_lock();
        let reloading = lock.write().await;
        let context = daycare_llm::InferenceContext::default();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            deps.router.complete(&context, "agent-1", Default::default()),
        )
        .await;
        assert!(blocked.is_err());

        drop(reloading);
        let done = deps
            .router
            .complete(&context, "agent-1", Default::default())
            .await
            .unwrap();
        assert_eq!(done.provider_id, "mock");
    }
}
