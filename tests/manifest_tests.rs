#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests.
//!
//! These tests verify that Cargo.toml keeps the agreed-upon lint gates,
//! feature layout and runtime requirements. If any test fails, the manifest
//! has drifted from project policy.

use std::path::PathBuf;

fn manifest() -> toml::Table {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    toml::from_str(&text).expect("Cargo.toml must parse")
}

fn strings(value: &toml::Value) -> Vec<&str> {
    value
        .as_array()
        .expect("expected an array")
        .iter()
        .map(|v| v.as_str().expect("expected a string"))
        .collect()
}

#[test]
fn clippy_panic_lints_are_denied() {
    let manifest = manifest();
    let clippy = manifest["lints"]["clippy"].as_table().unwrap();
    for lint in [
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ] {
        assert_eq!(
            clippy.get(lint).and_then(toml::Value::as_str),
            Some("deny"),
            "clippy::{lint} must be denied in library code"
        );
    }
}

#[test]
fn default_features_ship_both_transports() {
    let manifest = manifest();
    let features = manifest["features"].as_table().unwrap();
    assert_eq!(
        strings(&features["default"]),
        ["transport-websocket", "http-client"]
    );
    assert!(strings(&features["transport-websocket"]).contains(&"dep:tokio-tungstenite"));
    assert!(strings(&features["http-client"]).contains(&"dep:reqwest"));
}

#[test]
fn transport_crates_are_optional() {
    let manifest = manifest();
    let deps = manifest["dependencies"].as_table().unwrap();
    for name in ["tokio-tungstenite", "futures-util", "reqwest", "url"] {
        assert_eq!(
            deps[name].get("optional").and_then(toml::Value::as_bool),
            Some(true),
            "`{name}` must stay behind a feature"
        );
    }
}

#[test]
fn tokio_runtime_features_are_enabled() {
    let manifest = manifest();
    let tokio_features = strings(&manifest["dependencies"]["tokio"]["features"]);
    for feature in ["sync", "macros", "rt", "time"] {
        assert!(
            tokio_features.contains(&feature),
            "tokio feature `{feature}` is required by the sync loop"
        );
    }
}

#[test]
fn reqwest_avoids_native_tls() {
    let manifest = manifest();
    let reqwest = &manifest["dependencies"]["reqwest"];
    assert_eq!(
        reqwest.get("default-features").and_then(toml::Value::as_bool),
        Some(false)
    );
    assert!(strings(&reqwest["features"]).contains(&"rustls-tls"));
}
