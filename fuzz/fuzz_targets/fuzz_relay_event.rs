#![no_main]

use libfuzzer_sys::fuzz_target;
use tictac_sync::protocol::{ChannelKind, GAME_EVENTS, LOBBY_EVENTS, USER_EVENTS};
use tictac_sync::{SyncBridge, SyncUpdate};

fuzz_target!(|data: &[u8]| {
    // First byte picks the channel class and event, the rest is the payload.
    let Some((&selector, payload)) = data.split_first() else {
        return;
    };
    let (kind, events) = match selector % 3 {
        0 => (ChannelKind::Lobby, LOBBY_EVENTS),
        1 => (ChannelKind::Game("1".into()), GAME_EVENTS),
        _ => (ChannelKind::User("ann".into()), USER_EVENTS),
    };
    let Some(event) = events.get(usize::from(selector / 3) % events.len()) else {
        return;
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return;
    };

    // Decoding must never panic, and applying whatever decodes must not either.
    if let Ok(Some(update)) = SyncUpdate::from_event(&kind, event, value.clone()) {
        let mut bridge = SyncBridge::new();
        bridge.begin_join("1", "ann");
        bridge.set_stats_user("ann");
        bridge.apply(update);
    }

    // Relays sometimes double-encode `data` as a string.
    let _ = SyncUpdate::from_event(&kind, event, serde_json::Value::String(value.to_string()));
});
