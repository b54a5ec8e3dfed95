//! Client transport against an in-process server.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use lodestar_lsp::{
    ClientSettings, DiagnosticSeverity, IndexingOutcome, LspClient, LspError, TransportState,
};
use serde_json::{Value, json};

use crate::common::{
    Action, Handler, connect, fast_settings, project, spawn_fake_server,
};

const URI: &str = "file:///ws/app/src/main.rs";

fn symbol(name: &str, line: u32) -> Value {
    json!({
        "name": name,
        "kind": 12,
        "location": {
            "uri": URI,
            "range": {
                "start": {"line": line, "character": 0},
                "end": {"line": line, "character": 4}
            }
        }
    })
}

fn diagnostics(messages: &[(&str, u32)]) -> Value {
    let items: Vec<Value> = messages
        .iter()
        .map(|(message, line)| {
            json!({
                "range": {
                    "start": {"line": line, "character": 0},
                    "end": {"line": line, "character": 1}
                },
                "severity": 1,
                "source": "fake",
                "message": message
            })
        })
        .collect();
    json!({"uri": URI, "diagnostics": items})
}

fn handler(f: impl Fn(&str, &Value) -> Option<Vec<Action>> + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

#[tokio::test]
async fn test_handshake_reaches_initialized() {
    let (client, received) = connect(None, fast_settings()).await;

    assert_eq!(client.state(), TransportState::Initialized);
    assert!(client.is_alive());
    let methods = received.methods();
    assert_eq!(&methods[..2], ["initialize", "initialized"]);

    let init = &received.params_of("initialize")[0];
    assert_eq!(init["rootUri"], "file:///ws/app");
    assert_eq!(init["capabilities"]["window"]["workDoneProgress"], true);
}

#[tokio::test]
async fn test_handshake_without_capabilities_fails() {
    let live = Arc::new(AtomicUsize::new(0));
    let conn = spawn_fake_server(
        Some(handler(|method, _| {
            (method == "initialize").then(|| vec![Action::Respond(json!({"serverInfo": {}}))])
        })),
        live,
    );

    let err = LspClient::connect(
        conn.reader,
        conn.writer,
        project("/ws/app", "rust"),
        fast_settings(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, LspError::Handshake { .. }), "got {err:?}");
    assert!(err.is_unavailable());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_is_unavailable() {
    let live = Arc::new(AtomicUsize::new(0));
    let conn = spawn_fake_server(
        Some(handler(|method, _| (method == "initialize").then(Vec::new))),
        live,
    );
    let mut settings = fast_settings();
    settings.init_timeout = Duration::from_millis(200);

    let err = LspClient::connect(conn.reader, conn.writer, project("/ws/app", "rust"), settings)
        .await
        .unwrap_err();

    match err {
        LspError::Handshake { reason, .. } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected handshake error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_responses_match_by_id() {
    let (client, _) = connect(
        Some(handler(|method, params| {
            if method != "workspace/symbol" {
                return None;
            }
            let result = json!([symbol(params["query"].as_str().unwrap_or(""), 1)]);
            Some(match params["query"].as_str() {
                Some("slow") => vec![Action::RespondAfter(Duration::from_millis(300), result)],
                _ => vec![Action::Respond(result)],
            })
        })),
        fast_settings(),
    )
    .await;

    let (slow, fast) = tokio::join!(
        client.workspace_symbols("slow"),
        client.workspace_symbols("fast")
    );

    let slow = slow.unwrap();
    let fast = fast.unwrap();
    assert_eq!(slow[0].name, "slow");
    assert_eq!(fast[0].name, "fast");
    assert_eq!(slow[0].kind_label(), "function");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_one_call_and_keeps_transport() {
    let (client, _) = connect(
        Some(handler(|method, _| match method {
            "textDocument/hover" => Some(Vec::new()),
            "textDocument/definition" => Some(vec![Action::RespondAfter(
                Duration::from_secs(5),
                json!([]),
            )]),
            _ => None,
        })),
        fast_settings(),
    )
    .await;

    let err = client.hover(URI, 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { ref method, .. } if method == "textDocument/hover"));
    assert_eq!(client.pending_requests(), 0, "timed-out entry must be removed");

    // Response arrives after the deadline; it must be dropped quietly.
    let err = client.definition(URI, 0, 0).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { .. }));
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(client.state(), TransportState::Initialized);
    let symbols = client.workspace_symbols("anything").await.unwrap();
    assert!(symbols.is_empty());
}

#[tokio::test]
async fn test_server_error_surfaces_code() {
    let (client, _) = connect(
        Some(handler(|method, _| {
            (method == "textDocument/references")
                .then(|| vec![Action::RespondError(-32801, "content modified".into())])
        })),
        fast_settings(),
    )
    .await;

    let err = client.references(URI, 3, 4).await.unwrap_err();
    match err {
        LspError::Server { code, message, .. } => {
            assert_eq!(code, -32801);
            assert_eq!(message, "content modified");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    assert!(client.is_alive());
}

#[tokio::test]
async fn test_query_results_are_normalized() {
    let (client, received) = connect(
        Some(handler(|method, _| match method {
            "textDocument/definition" => Some(vec![Action::Respond(json!({
                "targetUri": "file:///ws/app/src/lib.rs",
                "targetRange": {"start": {"line": 9, "character": 0}, "end": {"line": 12, "character": 1}},
                "targetSelectionRange": {"start": {"line": 9, "character": 7}, "end": {"line": 9, "character": 11}}
            }))]),
            "textDocument/hover" => Some(vec![Action::Respond(json!({
                "contents": {"kind": "markdown", "value": "fn main()"}
            }))]),
            "textDocument/documentSymbol" => Some(vec![Action::Respond(json!([{
                "name": "Server",
                "kind": 23,
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 20, "character": 1}},
                "selectionRange": {"start": {"line": 0, "character": 11}, "end": {"line": 0, "character": 17}},
                "children": [{
                    "name": "run",
                    "kind": 6,
                    "range": {"start": {"line": 4, "character": 4}, "end": {"line": 8, "character": 5}},
                    "selectionRange": {"start": {"line": 4, "character": 11}, "end": {"line": 4, "character": 14}}
                }]
            }]))]),
            _ => None,
        })),
        fast_settings(),
    )
    .await;

    let defs = client.definition(URI, 2, 5).await.unwrap();
    assert_eq!(defs.len(), 1);
    assert_eq!(defs[0].uri, "file:///ws/app/src/lib.rs");
    assert_eq!(defs[0].range.start.line, 9);

    let hover = client.hover(URI, 2, 5).await.unwrap().unwrap();
    assert_eq!(hover.contents, "fn main()");

    let outline = client.document_symbols(URI).await.unwrap();
    let names: Vec<_> = outline.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Server", "run"]);
    assert_eq!(outline[1].container_name.as_deref(), Some("Server"));

    let def_params = &received.params_of("textDocument/definition")[0];
    assert_eq!(def_params["position"], json!({"line": 2, "character": 5}));
}

#[tokio::test]
async fn test_reopen_sends_did_change_with_next_version() {
    let (client, received) = connect(None, fast_settings()).await;

    client.open_document(URI, "fn main() {}").await.unwrap();
    client.open_document(URI, "fn main() { }").await.unwrap();
    assert!(client.is_open(URI));
    client.close_document(URI).await.unwrap();
    assert!(!client.is_open(URI));
    // Flush the writer queue.
    client.workspace_symbols("").await.unwrap();

    let open = received.params_of("textDocument/didOpen");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0]["textDocument"]["version"], 1);
    assert_eq!(open[0]["textDocument"]["languageId"], "rust");

    let change = received.params_of("textDocument/didChange");
    assert_eq!(change.len(), 1);
    assert_eq!(change[0]["textDocument"]["version"], 2);
    assert_eq!(change[0]["contentChanges"][0]["text"], "fn main() { }");

    assert_eq!(received.params_of("textDocument/didClose").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_settle_returns_latest_pass() {
    let (client, _) = connect(
        Some(handler(|method, _| {
            (method == "textDocument/didOpen").then(|| {
                vec![
                    Action::Notify(
                        "textDocument/publishDiagnostics".into(),
                        diagnostics(&[("syntax pass", 0)]),
                    ),
                    Action::NotifyAfter(
                        Duration::from_millis(30),
                        "textDocument/publishDiagnostics".into(),
                        diagnostics(&[("semantic pass", 4), ("unused variable", 7)]),
                    ),
                ]
            })
        })),
        fast_settings(),
    )
    .await;

    client.open_document(URI, "fn main() {}").await.unwrap();
    let items = client
        .wait_for_diagnostics(URI, Duration::from_secs(5))
        .await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].message(), "semantic pass");
    assert_eq!(items[0].severity(), DiagnosticSeverity::Error);
    assert!(client.received_diagnostics());
    assert_eq!(client.diagnostics_snapshot().error_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_wait_returns_empty_at_ceiling() {
    let (client, _) = connect(None, fast_settings()).await;

    let started = tokio::time::Instant::now();
    let items = client
        .wait_for_diagnostics(URI, Duration::from_millis(400))
        .await;

    assert!(items.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(!client.received_diagnostics());
}

#[tokio::test(start_paused = true)]
async fn test_indexing_waits_for_progress_end() {
    let progress = |value: Value| {
        Action::Notify(
            "$/progress".into(),
            json!({"token": "rustAnalyzer/Indexing", "value": value}),
        )
    };
    let (client, _) = connect(
        Some(handler(move |method, _| {
            (method == "initialized").then(|| {
                vec![
                    Action::Request(
                        json!(900),
                        "window/workDoneProgress/create".into(),
                        json!({"token": "rustAnalyzer/Indexing"}),
                    ),
                    progress(json!({"kind": "begin", "title": "Indexing", "percentage": 0})),
                    Action::NotifyAfter(
                        Duration::from_millis(200),
                        "$/progress".into(),
                        json!({"token": "rustAnalyzer/Indexing", "value": {"kind": "end"}}),
                    ),
                ]
            })
        })),
        fast_settings(),
    )
    .await;

    assert_eq!(client.wait_for_indexing().await, IndexingOutcome::Complete);
    assert_eq!(client.indexing_in_progress(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_indexing_without_progress_proceeds_after_grace() {
    let (client, _) = connect(None, fast_settings()).await;
    assert_eq!(
        client.wait_for_indexing().await,
        IndexingOutcome::NoProgressReported
    );
}

#[tokio::test]
async fn test_server_requests_get_answers() {
    let (client, received) = connect(
        Some(handler(|method, _| {
            (method == "initialized").then(|| {
                vec![
                    Action::Request(
                        json!(1),
                        "workspace/configuration".into(),
                        json!({"items": [{"section": "rust-analyzer"}, {"section": "files"}]}),
                    ),
                    Action::Request(json!("reg-1"), "client/registerCapability".into(), json!({})),
                    Action::Request(json!(2), "window/showDocument".into(), json!({})),
                ]
            })
        })),
        fast_settings(),
    )
    .await;
    // A round trip guarantees the replies were written first.
    client.workspace_symbols("").await.unwrap();

    let replies = received.replies();
    let config = replies.iter().find(|r| r["id"] == 1).unwrap();
    assert_eq!(config["result"], json!([null, null]));
    let register = replies.iter().find(|r| r["id"] == "reg-1").unwrap();
    assert!(register["result"].is_null());
    let unknown = replies.iter().find(|r| r["id"] == 2).unwrap();
    assert_eq!(unknown["error"]["code"], -32601);
}

#[tokio::test]
async fn test_crash_fails_pending_and_later_calls() {
    let (client, _) = connect(
        Some(handler(|method, _| (method == "workspace/symbol").then(|| vec![Action::Hangup]))),
        fast_settings(),
    )
    .await;

    let err = client.workspace_symbols("boom").await.unwrap_err();
    assert!(matches!(err, LspError::ConnectionClosed), "got {err:?}");
    assert_eq!(client.state(), TransportState::Crashed);

    let err = client.hover(URI, 0, 0).await.unwrap_err();
    assert!(matches!(
        err,
        LspError::NotInitialized {
            state: TransportState::Crashed
        }
    ));

    // Stopping a crashed client is harmless and keeps the crash visible.
    client.shutdown().await;
    assert_eq!(client.state(), TransportState::Crashed);
}

#[tokio::test]
async fn test_shutdown_is_graceful_and_idempotent() {
    let (client, received) = connect(None, fast_settings()).await;

    client.shutdown().await;
    assert_eq!(client.state(), TransportState::Stopped);
    let methods = received.methods();
    assert!(methods.contains(&"shutdown".to_string()));
    assert_eq!(methods.last().map(String::as_str), Some("exit"));

    client.shutdown().await;
    assert_eq!(client.state(), TransportState::Stopped);
    let err = client.workspace_symbols("x").await.unwrap_err();
    assert!(matches!(err, LspError::NotInitialized { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_marks_transport_crashed() {
    let (client, _) = connect(
        Some(handler(|method, params| {
            (method == "workspace/symbol" && params["query"] == "deafen")
                .then(|| vec![Action::Deafen])
        })),
        fast_settings(),
    )
    .await;

    // The server stopped reading, but its output is still open.
    let err = client.workspace_symbols("deafen").await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { .. }), "got {err:?}");
    assert_eq!(client.state(), TransportState::Initialized);

    let err = client.workspace_symbols("again").await.unwrap_err();
    assert!(matches!(err, LspError::ConnectionClosed), "got {err:?}");
    assert_eq!(client.state(), TransportState::Crashed);
    assert_eq!(client.pending_requests(), 0);
}

/// Tally of calls that raced their deadline.
#[derive(Default, Debug)]
struct RaceOutcome {
    answered: usize,
    timed_out: usize,
}

async fn race_queries(client: &Arc<LspClient>, queries: Vec<String>) -> RaceOutcome {
    let calls: Vec<_> = queries
        .into_iter()
        .map(|query| {
            let client = client.clone();
            tokio::spawn(async move { client.workspace_symbols(&query).await })
        })
        .collect();

    let mut outcome = RaceOutcome::default();
    for call in calls {
        match call.await.unwrap() {
            Ok(symbols) => {
                assert!(symbols.is_empty());
                outcome.answered += 1;
            }
            Err(LspError::Timeout { .. }) => outcome.timed_out += 1,
            Err(other) => panic!("call resolved with {other:?}"),
        }
    }
    outcome
}

#[tokio::test(start_paused = true)]
async fn test_response_at_deadline_resolves_each_call_once() {
    let timeout = Duration::from_millis(100);
    let (client, _) = connect(
        Some(handler(move |method, params| {
            (method == "workspace/symbol").then(|| match params["query"].as_str() {
                Some("tie") => vec![Action::RespondAfter(timeout, json!([]))],
                _ => vec![Action::Respond(json!([]))],
            })
        })),
        ClientSettings {
            request_timeout: timeout,
            ..fast_settings()
        },
    )
    .await;
    let client = Arc::new(client);

    let outcome = race_queries(&client, vec!["tie".to_string(); 32]).await;
    assert_eq!(outcome.answered + outcome.timed_out, 32, "{outcome:?}");
    assert_eq!(client.pending_requests(), 0);

    // Answers for ids already claimed by a timeout are dropped.
    tokio::time::sleep(timeout).await;
    assert!(client.is_alive());
    assert!(client.workspace_symbols("now").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_responses_racing_timeouts_resolve_exactly_once() {
    let (client, _) = connect(
        Some(handler(|method, params| {
            if method != "workspace/symbol" {
                return None;
            }
            let delay_ms = params["query"].as_str()?.parse().ok()?;
            Some(vec![Action::RespondAfter(
                Duration::from_millis(delay_ms),
                json!([]),
            )])
        })),
        ClientSettings {
            request_timeout: Duration::from_millis(100),
            ..fast_settings()
        },
    )
    .await;
    let client = Arc::new(client);

    // Delays straddle the 100ms deadline.
    let queries = (0..40).map(|i| (90 + i % 21).to_string()).collect();
    let outcome = race_queries(&client, queries).await;

    assert_eq!(outcome.answered + outcome.timed_out, 40, "{outcome:?}");
    assert_eq!(client.pending_requests(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_alive());
    assert!(client.workspace_symbols("0").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_server_requests_all_get_replies() {
    // More requests in one burst than the client's outgoing queue holds.
    let (client, received) = connect(
        Some(handler(|method, _| {
            (method == "workspace/symbol").then(|| {
                let mut actions: Vec<Action> = (0..200)
                    .map(|i| {
                        Action::Request(
                            json!(format!("cfg-{i}")),
                            "workspace/configuration".to_string(),
                            json!({"items": [{"section": "x"}]}),
                        )
                    })
                    .collect();
                actions.push(Action::Respond(json!([])));
                actions
            })
        })),
        fast_settings(),
    )
    .await;

    client.workspace_symbols("flood").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let replies = received.replies();
    assert_eq!(replies.len(), 200);
    assert!(replies.iter().all(|r| r["result"] == json!([null])));
    assert!(client.is_alive());
}
