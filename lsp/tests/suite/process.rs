//! Spawned servers whose process exits while a helper keeps stdout open.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lodestar_lsp::{
    LspClient, LspConfig, LspError, ProjectRoot, ServerCache, ServerConfig, ServerRegistry,
    TransportState,
};

use crate::common::fast_settings;

const INITIALIZE_RESULT: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#;

/// A shell server that answers `initialize`, waits for `initialized`, then
/// exits and leaves a background `sleep` holding its stdout and stdin.
fn exiting_server_args() -> Vec<String> {
    // `read` stops at newlines: the first one ends the request header, the
    // next two only complete once the `initialized` header has been written.
    let script = format!(
        "read -r _; printf 'Content-Length: {}\\r\\n\\r\\n%s' '{INITIALIZE_RESULT}'; \
         read -r _; read -r _; sleep 30 & exit 0",
        INITIALIZE_RESULT.len()
    );
    vec!["-c".to_string(), script]
}

async fn wait_for_state(client: &LspClient, state: TransportState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.state() != state {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client still {} after 5s", client.state()));
}

#[tokio::test]
async fn test_process_exit_marks_client_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let mut descriptor = ServerRegistry::builtin().get("rust").cloned().unwrap();
    descriptor.command = "sh".to_string();
    descriptor.args = exiting_server_args();
    let project = ProjectRoot::new(dir.path().to_path_buf(), "rust", "Cargo.toml", false);

    let client = LspClient::start(&descriptor, &project, fast_settings())
        .await
        .unwrap();
    wait_for_state(&client, TransportState::Crashed).await;

    assert!(!client.is_alive());
    assert_eq!(client.pending_requests(), 0);
    let err = client.workspace_symbols("x").await.unwrap_err();
    assert!(matches!(
        err,
        LspError::NotInitialized {
            state: TransportState::Crashed
        }
    ));

    client.shutdown().await;
    assert_eq!(client.state(), TransportState::Crashed);
}

#[tokio::test]
async fn test_cache_replaces_client_whose_process_exited() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = LspConfig::default();
    config.servers.insert(
        "rust".to_string(),
        ServerConfig {
            command: Some("sh".to_string()),
            args: Some(exiting_server_args()),
            ..ServerConfig::default()
        },
    );
    let cache = ServerCache::new(config, dir.path());
    let project = ProjectRoot::new(dir.path().to_path_buf(), "rust", "Cargo.toml", false);

    let first = cache.get_client(&project, None).await.unwrap();
    wait_for_state(&first, TransportState::Crashed).await;

    let second = cache.get_client(&project, None).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(cache.current_project().await.as_ref(), Some(&project));
    assert_eq!(second.project().path(), Path::new(dir.path()));

    cache.shutdown().await;
}
