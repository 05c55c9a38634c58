#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
#![cfg(feature = "http-client")]
//! `HttpGameApi` tests against an `httpmock` server.

use httpmock::prelude::*;
use serde_json::json;

use tictac_sync::{ConfigSource, GameApi, HttpGameApi, SyncError};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn game_body(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "board": [null, null, null, null, "X", null, null, null, null],
        "players": ["ann", "bob"],
        "currentTurn": "bob",
        "status": "playing",
        "updatedAt": 10
    })
}

fn api(server: &MockServer) -> HttpGameApi {
    HttpGameApi::new(&server.url("/api")).unwrap()
}

// ════════════════════════════════════════════════════════════════════
// Reads
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn list_games_decodes_the_lobby() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/game/list");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!([game_body("1"), game_body("2")]));
        })
        .await;

    let games = api(&server).list_games().await.unwrap();
    mock.assert_async().await;
    assert_eq!(games.len(), 2);
    assert_eq!(games[0].current_turn.as_deref(), Some("bob"));
}

#[tokio::test]
async fn get_game_uses_the_id_path() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/games/42");
            then.status(200).json_body(game_body("42"));
        })
        .await;

    let game = api(&server).get_game("42").await.unwrap();
    mock.assert_async().await;
    assert_eq!(game.id, "42");
    assert_eq!(game.updated_at, Some(10));
}

#[tokio::test]
async fn get_chat_passes_game_id_as_query() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/chat").query_param("gameId", "7");
            then.status(200).json_body(json!([
                { "gameId": "7", "username": "ann", "message": "hi" },
                { "gameId": "7", "username": "bob", "message": "hey" }
            ]));
        })
        .await;

    let chat = api(&server).get_chat("7").await.unwrap();
    mock.assert_async().await;
    let lines: Vec<_> = chat.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(lines, ["hi", "hey"]);
}

#[tokio::test]
async fn get_stats_for_user() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/stats/ann");
            then.status(200)
                .json_body(json!({ "username": "ann", "wins": 4, "losses": 1, "draws": 2 }));
        })
        .await;

    let stats = api(&server).get_stats("ann").await.unwrap();
    assert_eq!((stats.wins, stats.losses, stats.draws), (4, 1, 2));
}

// ════════════════════════════════════════════════════════════════════
// Writes
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_game_posts_camel_case_body() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/game/join")
                .json_body(json!({ "gameId": "3", "username": "ann" }));
            then.status(200).json_body(game_body("3"));
        })
        .await;

    let game = api(&server).join_game("3", "ann").await.unwrap();
    mock.assert_async().await;
    assert_eq!(game.id, "3");
}

#[tokio::test]
async fn make_move_sends_position() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/game/move")
                .json_body(json!({ "gameId": "3", "username": "ann", "position": 4 }));
            then.status(200).json_body(game_body("3"));
        })
        .await;

    let game = api(&server).make_move("3", "ann", 4).await.unwrap();
    mock.assert_async().await;
    assert_eq!(game.board.get(4), Some(tictac_sync::protocol::Mark::X));
}

#[tokio::test]
async fn unit_responses_ignore_the_body() {
    let server = MockServer::start_async().await;
    let chat = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body(json!({ "gameId": "3", "username": "ann", "message": "gg" }));
            then.status(204);
        })
        .await;
    let leave = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/game/leave");
            then.status(200).body("ok");
        })
        .await;

    let api = api(&server);
    api.send_chat("3", "ann", "gg").await.unwrap();
    api.leave_game("3", "ann").await.unwrap();
    chat.assert_async().await;
    leave.assert_async().await;
}

// ════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn server_error_carries_status_and_body() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/game/create");
            then.status(500).body("database down");
        })
        .await;

    let err = api(&server).create_game("ann").await.unwrap_err();
    match err {
        SyncError::Http { status, message } => {
            assert_eq!(status, Some(500));
            assert!(message.contains("database down"), "{message}");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_an_http_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/game/list");
            then.status(200).body("<html>not json</html>");
        })
        .await;

    let err = api(&server).list_games().await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: Some(200), .. }));
}

#[tokio::test]
async fn unreachable_server_has_no_status() {
    let api = HttpGameApi::new("http://127.0.0.1:9/api").unwrap();
    let err = api.list_games().await.unwrap_err();
    assert!(matches!(err, SyncError::Http { status: None, .. }));
}

// ════════════════════════════════════════════════════════════════════
// Relay credentials
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn fetch_config_returns_credentials() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/config");
            then.status(200).json_body(json!({ "key": "abc", "cluster": "eu" }));
        })
        .await;

    let credentials = api(&server).fetch_config().await.unwrap();
    assert_eq!(credentials.key, "abc");
    assert_eq!(credentials.cluster.as_deref(), Some("eu"));
}

#[tokio::test]
async fn config_failures_are_config_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/config");
            then.status(200).json_body(json!({ "cluster": "eu" }));
        })
        .await;
    let err = api(&server).fetch_config().await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)), "{err:?}");

    let unreachable = HttpGameApi::new("http://127.0.0.1:9/").unwrap();
    let err = unreachable.fetch_config().await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)), "{err:?}");
}
