use super::*;
use serde_json::json;

fn registry() -> ClientRegistry<MergeReducer> {
    ClientRegistry::new(MergeReducer::default())
}

#[test]
fn add_client_uses_target_identity() {
    let reducer = registry();
    let state = reducer.initial_state();
    let next = reducer.reduce(&state, &Action::add_client("ignored").with_client("c1"));
    assert_eq!(next.clients.get("c1"), Some(&json!({"id": "c1"})));
    assert!(!next.clients.contains("ignored"));
}

#[test]
fn add_client_falls_back_to_payload_id() {
    let reducer = registry();
    let next = reducer.reduce(&reducer.initial_state(), &Action::add_client("c2"));
    assert!(next.clients.contains("c2"));
}

#[test]
fn add_client_twice_keeps_one_record() {
    let reducer = registry();
    let once = reducer.reduce(&reducer.initial_state(), &Action::add_client("c1"));
    let twice = reducer.reduce(&once, &Action::add_client("c1"));
    assert_eq!(twice.clients.items.len(), 1);
}

#[test]
fn merge_updates_shared_when_untargeted() {
    let reducer = registry();
    let next = reducer.reduce(&reducer.initial_state(), &Action::new(MERGE, json!({"title": "t"})));
    assert_eq!(next.shared, json!({"title": "t"}));
}

#[test]
fn merge_updates_only_the_target_client() {
    let reducer = registry();
    let mut state = reducer.initial_state();
    state = reducer.reduce(&state, &Action::add_client("c1"));
    state = reducer.reduce(&state, &Action::add_client("c2"));

    let next = reducer.reduce(&state, &Action::new(MERGE, json!({"cursor": 3})).with_client("c2"));
    assert_eq!(next.clients.get("c1"), Some(&json!({"id": "c1"})));
    assert_eq!(next.clients.get("c2"), Some(&json!({"id": "c2", "cursor": 3})));
    assert_eq!(next.shared, json!({}));
}

#[test]
fn unknown_actions_are_identity() {
    let reducer = registry();
    let state = reducer.initial_state();
    assert_eq!(reducer.reduce(&state, &Action::new("PING", json!(null))), state);
}
