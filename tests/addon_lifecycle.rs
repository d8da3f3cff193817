use hostpipe::Host;
use hostpipe::addon::AddonManifest;
use hostpipe::addon::composer::Block;
use hostpipe::host::signal::{SignalHandler, SignalSource};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn manifest(value: serde_json::Value) -> AddonManifest {
    serde_json::from_value(value).unwrap()
}

#[test]
fn enabled_message_surfaces_as_an_element() {
    let host = Host::ephemeral(true);

    host.addons()
        .load(manifest(json!({
            "id": "welcome",
            "kind": "message",
            "message": {
                "title": "Welcome",
                "subtitle": "Hello there",
                "blocks": [
                    { "id": "b1", "type": "text", "text": "First block" },
                ],
            },
        })))
        .unwrap();

    assert_eq!(host.addons().is_enabled("welcome"), Some(true));
    assert_eq!(host.dispatch("query message-welcome").value, Some(json!(true)));
    assert_eq!(
        host.dispatch("property message-welcome title").value,
        Some(json!("Welcome"))
    );
    assert_eq!(
        host.dispatch("property message-welcome blockCount").value,
        Some(json!(1))
    );
}

#[test]
fn composer_edits_are_visible_to_the_driver() {
    let host = Host::ephemeral(true);

    host.addons()
        .load(manifest(json!({
            "id": "notes",
            "kind": "message",
            "message": { "title": "Original", "blocks": [] },
        })))
        .unwrap();

    let composer = host.addons().composer("notes").unwrap();
    composer.set_title("Edited");
    composer.append(Block {
        id: "extra".to_string(),
        kind: "text".to_string(),
        text: "Appended".to_string(),
    });
    composer.set_badge(Some("new"));
    composer.set_is_read(true);

    assert_eq!(
        host.dispatch("property message-notes title").value,
        Some(json!("Edited"))
    );
    assert_eq!(
        host.dispatch("property message-notes blockCount").value,
        Some(json!(1))
    );
    assert_eq!(
        host.dispatch("property message-notes badge").value,
        Some(json!("new"))
    );
    assert_eq!(
        host.dispatch("property message-notes isRead").value,
        Some(json!(true))
    );

    composer.reset_message();
    assert_eq!(
        host.dispatch("property message-notes title").value,
        Some(json!("Original"))
    );
    assert_eq!(
        host.dispatch("property message-notes isRead").value,
        Some(json!(false))
    );
}

#[test]
fn composer_block_operations() {
    let host = Host::ephemeral(true);

    host.addons()
        .load(manifest(json!({
            "id": "blocks",
            "kind": "message",
            "message": {
                "title": "Blocks",
                "blocks": [
                    { "id": "b1", "type": "text", "text": "one" },
                    { "id": "b2", "type": "text", "text": "two" },
                ],
            },
        })))
        .unwrap();

    let composer = host.addons().composer("blocks").unwrap();

    assert!(composer.set_text("b1", "updated"));
    assert!(!composer.set_text("missing", "nope"));

    composer.create(
        0,
        Block {
            id: "b0".to_string(),
            kind: "title".to_string(),
            text: "heading".to_string(),
        },
    );
    assert!(composer.remove("b2"));
    assert!(!composer.remove("b2"));

    let content = composer.content();
    let ids: Vec<&str> = content.blocks.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["b0", "b1"]);
    assert_eq!(content.blocks[1].text, "updated");
}

#[test]
fn unload_tears_down_subscriptions_and_elements() {
    let host = Host::ephemeral(true);

    let baseline = host.bus().subscription_count();
    host.addons()
        .load(manifest(json!({
            "id": "gated",
            "kind": "message",
            "conditions": { "enabled_features": ["testFeatureAddonApi"] },
            "message": { "title": "Gated" },
        })))
        .unwrap();
    assert!(host.bus().subscription_count() > baseline);

    host.state().flip_feature_on("testFeatureAddonApi");
    assert!(host.state().elements.query("message-gated"));

    host.addons().unload("gated").unwrap();
    assert_eq!(host.bus().subscription_count(), baseline);
    assert!(!host.state().elements.query("message-gated"));

    // A stale signal after unload must reach nothing.
    host.state().flip_feature_on("testFeatureAddonApi");
    assert!(!host.state().elements.query("message-gated"));
}

#[test]
fn reloading_an_addon_replaces_the_previous_instance() {
    let host = Host::ephemeral(true);

    let load = |title: &str| {
        manifest(json!({
            "id": "swap",
            "kind": "message",
            "conditions": { "enabled_features": ["testFeatureAddonApi"] },
            "message": { "title": title },
        }))
    };

    let baseline = host.bus().subscription_count();
    host.addons().load(load("first")).unwrap();
    let first_instance = host.addons().instance("swap").unwrap();
    let after_first = host.bus().subscription_count();

    host.addons().load(load("second")).unwrap();
    assert_ne!(host.addons().instance("swap"), Some(first_instance));
    // Hot-swap must not leak the previous incarnation's subscriptions.
    assert_eq!(host.bus().subscription_count(), after_first);
    assert!(host.bus().subscription_count() > baseline);
}

#[test]
fn hard_reset_unloads_every_addon() {
    let host = Host::ephemeral(true);

    host.addons()
        .load(manifest(json!({
            "id": "a",
            "kind": "message",
            "message": { "title": "A" },
        })))
        .unwrap();
    host.addons()
        .load(manifest(json!({
            "id": "b",
            "kind": "message",
            "message": { "title": "B" },
        })))
        .unwrap();
    assert_eq!(host.addons().loaded_ids().len(), 2);

    host.hard_reset().unwrap();
    assert!(host.addons().loaded_ids().is_empty());
    assert!(!host.state().elements.query("message-a"));
}

#[test]
fn tutorial_plays_through_clicks() {
    let host = Host::ephemeral(true);
    let root = TempDir::new().unwrap();

    let path = root.path().join("tour.json");
    fs::write(
        &path,
        serde_json::to_string(&json!({
            "id": "tour",
            "kind": "tutorial",
            "tutorial": {
                "steps": [
                    { "id": "s1", "element": "main/getStarted", "title": "Start here" },
                    { "id": "s2", "element": "main/settingsButton", "title": "Open settings" },
                ],
            },
        }))
        .unwrap(),
    )
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let completed_hits = completed.clone();
    let on_completed: SignalHandler = Arc::new(move |_signal| {
        completed_hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    host.bus()
        .subscribe(SignalSource::addon("tour"), "tutorialCompleted", on_completed);

    let response = host.dispatch(&format!("tutorial {}", path.display()));
    assert!(response.error.is_none(), "{:?}", response.error);

    assert_eq!(host.dispatch("query tutorial").value, Some(json!(true)));
    assert_eq!(
        host.dispatch("property tutorial currentStep").value,
        Some(json!(0))
    );
    assert_eq!(
        host.dispatch("property tutorial stepElement").value,
        Some(json!("main/getStarted"))
    );

    // Clicking an unrelated element does not advance.
    host.dispatch("click main/getHelpLink");
    assert_eq!(
        host.dispatch("property tutorial currentStep").value,
        Some(json!(0))
    );

    host.dispatch("click main/getStarted");
    assert_eq!(
        host.dispatch("property tutorial currentStep").value,
        Some(json!(1))
    );
    assert_eq!(
        host.dispatch("property tutorial stepElement").value,
        Some(json!("main/settingsButton"))
    );

    host.dispatch("click main/settingsButton");
    assert_eq!(host.dispatch("query tutorial").value, Some(json!(false)));
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    // Playback subscriptions are gone: further clicks reach nothing.
    host.dispatch("click main/getStarted");
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[test]
fn disabled_tutorial_refuses_to_start() {
    let host = Host::ephemeral(true);

    host.addons()
        .load(manifest(json!({
            "id": "hidden-tour",
            "kind": "tutorial",
            "conditions": { "never": {} },
            "tutorial": { "steps": [ { "id": "s1", "element": "main" } ] },
        })))
        .unwrap();

    let err = host.addons().start_tutorial("hidden-tour").unwrap_err();
    assert!(err.to_string().contains("disabled"));
}

#[test]
fn message_addon_rejects_unknown_kind() {
    let host = Host::ephemeral(true);

    let err = host
        .addons()
        .load(manifest(json!({ "id": "x", "kind": "widget" })))
        .unwrap_err();
    assert!(err.to_string().contains("widget"));
}

#[test]
fn load_addon_command_reports_missing_files() {
    let host = Host::ephemeral(true);

    let response = host.dispatch("load_addon /no/such/manifest.json");
    assert!(response.error.is_some());
}
