#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

mod support;

use std::time::Duration;

use serde_json::{Value, json};
use support::{Peer, attach_client, long_idle, spawn_mux};

/// Initializes a client against the tsgo spec. `with_pull` controls whether
/// the client itself advertises pull-diagnostic capability.
async fn initialize_tsgo(client: &mut Peer, server: &mut Peer, id: i64, with_pull: bool) -> Value {
    let capabilities = if with_pull {
        json!({"textDocument": {"diagnostic": {}}})
    } else {
        json!({})
    };
    client
        .send(json!({"jsonrpc": "2.0", "id": id, "method": "initialize", "params": {"capabilities": capabilities}}))
        .await;

    let forwarded = server.recv().await;
    assert_eq!(forwarded["method"], json!("initialize"));
    server
        .send(json!({"jsonrpc": "2.0", "id": forwarded["id"], "result": {"capabilities": {}}}))
        .await;
    client.recv().await;

    forwarded
}

fn did_open(uri: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/didOpen",
        "params": {"textDocument": {"uri": uri, "languageId": "typescript", "version": 1, "text": ""}},
    })
}

fn did_save(uri: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "textDocument/didSave",
        "params": {"textDocument": {"uri": uri}},
    })
}

#[tokio::test]
async fn pull_capability_is_injected_into_initialize() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;

    let forwarded = initialize_tsgo(&mut a, &mut t.server, 1, false).await;
    assert!(
        forwarded
            .pointer("/params/capabilities/textDocument/diagnostic")
            .is_some(),
        "mux must advertise pull diagnostics to the server: {forwarded}"
    );
}

#[tokio::test]
async fn file_events_coalesce_into_one_pull_and_publish() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;
    initialize_tsgo(&mut a, &mut t.server, 1, false).await;

    // didOpen then didSave inside the debounce window.
    a.send(did_open("file:///x.ts")).await;
    a.send(did_save("file:///x.ts")).await;

    // The file events themselves are forwarded unchanged...
    assert_eq!(t.server.recv().await["method"], json!("textDocument/didOpen"));
    assert_eq!(t.server.recv().await["method"], json!("textDocument/didSave"));

    // ...followed by exactly one pull within the debounce window.
    let pull = t.server.recv().await;
    assert_eq!(pull["method"], json!("textDocument/diagnostic"));
    assert_eq!(pull["params"]["textDocument"]["uri"], json!("file:///x.ts"));
    assert_eq!(pull["params"]["identifier"], json!(null));
    assert_eq!(pull["params"]["previousResultId"], json!(null));
    assert!(
        t.server.try_recv(Duration::from_millis(300)).await.is_none(),
        "the two file events must coalesce into a single pull"
    );

    t.server
        .send(json!({
            "jsonrpc": "2.0",
            "id": pull["id"],
            "result": {"kind": "full", "items": [{"message": "from pull"}]},
        }))
        .await;

    let published = a.recv().await;
    assert_eq!(published["method"], json!("textDocument/publishDiagnostics"));
    assert_eq!(published["params"]["uri"], json!("file:///x.ts"));
    assert_eq!(published["params"]["diagnostics"], json!([{"message": "from pull"}]));
}

#[tokio::test]
async fn pull_capable_clients_never_see_synthesized_publishes() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;
    let mut b = attach_client(&t.handle).await;
    initialize_tsgo(&mut a, &mut t.server, 1, false).await;

    // B advertises pull diagnostics; its initialize is served from cache.
    b.send(json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "initialize",
        "params": {"capabilities": {"textDocument": {"diagnostic": {}}}},
    }))
    .await;
    b.recv().await;

    a.send(did_open("file:///x.ts")).await;
    t.server.recv().await; // forwarded didOpen

    let pull = t.server.recv().await;
    assert_eq!(pull["method"], json!("textDocument/diagnostic"));
    t.server
        .send(json!({
            "jsonrpc": "2.0",
            "id": pull["id"],
            "result": {"kind": "full", "items": [{"message": "m"}]},
        }))
        .await;

    // A (non-pull) gets the synthesized publish.
    let published = a.recv().await;
    assert_eq!(published["method"], json!("textDocument/publishDiagnostics"));

    // B gets nothing but the broadcast sentinel.
    t.server.send(json!({"jsonrpc": "2.0", "method": "custom/broadcast"})).await;
    let next = b.recv().await;
    assert_eq!(next["method"], json!("custom/broadcast"));
}

#[tokio::test]
async fn unchanged_reply_replays_cached_items() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;
    initialize_tsgo(&mut a, &mut t.server, 1, false).await;

    a.send(did_open("file:///x.ts")).await;
    t.server.recv().await; // forwarded didOpen
    let pull = t.server.recv().await;
    t.server
        .send(json!({
            "jsonrpc": "2.0",
            "id": pull["id"],
            "result": {"kind": "full", "items": [{"message": "first"}]},
        }))
        .await;
    let published = a.recv().await;
    assert_eq!(published["params"]["diagnostics"], json!([{"message": "first"}]));

    a.send(did_save("file:///x.ts")).await;
    t.server.recv().await; // forwarded didSave
    let pull = t.server.recv().await;
    t.server
        .send(json!({"jsonrpc": "2.0", "id": pull["id"], "result": {"kind": "unchanged"}}))
        .await;

    let published = a.recv().await;
    assert_eq!(
        published["params"]["diagnostics"],
        json!([{"message": "first"}]),
        "unchanged must replay the last published items"
    );
}

#[tokio::test]
async fn no_pull_when_every_client_is_pull_capable() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;
    initialize_tsgo(&mut a, &mut t.server, 1, true).await;

    a.send(did_open("file:///x.ts")).await;
    t.server.recv().await; // forwarded didOpen

    assert!(
        t.server.try_recv(Duration::from_millis(300)).await.is_none(),
        "no pull must be issued when no client needs the bridge"
    );
}

#[tokio::test]
async fn did_close_discards_cached_state() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;
    initialize_tsgo(&mut a, &mut t.server, 1, false).await;

    a.send(did_open("file:///x.ts")).await;
    t.server.recv().await;
    let pull = t.server.recv().await;
    t.server
        .send(json!({
            "jsonrpc": "2.0",
            "id": pull["id"],
            "result": {"kind": "full", "items": [{"message": "cached"}]},
        }))
        .await;
    a.recv().await;

    a.send(json!({
        "jsonrpc": "2.0",
        "method": "textDocument/didClose",
        "params": {"textDocument": {"uri": "file:///x.ts"}},
    }))
    .await;
    t.server.recv().await; // forwarded didClose

    // Reopen: an unchanged reply now publishes empty, the cache is gone.
    a.send(did_open("file:///x.ts")).await;
    t.server.recv().await;
    let pull = t.server.recv().await;
    t.server
        .send(json!({"jsonrpc": "2.0", "id": pull["id"], "result": {"kind": "unchanged"}}))
        .await;

    let published = a.recv().await;
    assert_eq!(published["params"]["diagnostics"], json!([]));
}

#[tokio::test]
async fn events_before_init_done_are_pulled_afterwards() {
    let mut t = spawn_mux("tsgo", long_idle());
    let mut a = attach_client(&t.handle).await;

    a.send(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"capabilities": {}}}))
        .await;
    let forwarded = t.server.recv().await;

    // File event while the handshake is still in flight.
    a.send(did_open("file:///early.ts")).await;
    assert_eq!(t.server.recv().await["method"], json!("textDocument/didOpen"));

    t.server
        .send(json!({"jsonrpc": "2.0", "id": forwarded["id"], "result": {"capabilities": {}}}))
        .await;
    a.recv().await;

    let pull = t.server.recv().await;
    assert_eq!(pull["method"], json!("textDocument/diagnostic"));
    assert_eq!(pull["params"]["textDocument"]["uri"], json!("file:///early.ts"));
}
