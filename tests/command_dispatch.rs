use hostpipe::Host;
use hostpipe::host::command::{Command, Response, encode_argument};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::io::Cursor;

fn run_lines(host: &Host, lines: &[&str]) -> Vec<Response> {
    let input = format!("{}\n", lines.join("\n"));
    let mut sink = Vec::<u8>::new();
    host.handle(Cursor::new(input), &mut sink).unwrap();

    sink.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice::<Response>(line).unwrap())
        .collect()
}

#[test]
fn responses_arrive_in_order_with_matching_types() {
    let host = Host::ephemeral(true);

    let responses = run_lines(
        &host,
        &[
            "query main/getHelpLink",
            "query main/getStarted",
            "languages",
            "query main/serverListButton",
        ],
    );

    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0].kind, "query");
    assert_eq!(responses[0].value, Some(json!(true)));
    assert_eq!(responses[1].kind, "query");
    assert_eq!(responses[2].kind, "languages");
    assert_eq!(responses[2].value, Some(json!(["en", "de", "fr"])));
    assert_eq!(responses[3].kind, "query");
}

#[test]
fn unknown_command_echoes_parsed_name() {
    let host = Host::ephemeral(false);

    let responses = run_lines(&host, &["noop", "   "]);
    assert_eq!(responses[0].kind, "noop");
    assert_eq!(responses[0].error.as_deref(), Some("invalid command"));
    // Only the blank line fails name parsing entirely; handle() skips it,
    // so a single malformed-name case is exercised directly:
    let response = host.dispatch("%");
    assert_eq!(response.kind, "%");
}

#[test]
fn wrong_arity_is_a_command_error() {
    let host = Host::ephemeral(true);

    let response = host.dispatch("query main extra");
    assert_eq!(response.kind, "query");
    assert_eq!(
        response.error.as_deref(),
        Some("wrong number of arguments (1 expected)")
    );
}

#[test]
fn malformed_percent_escape_reports_best_effort_name() {
    let host = Host::ephemeral(true);

    let response = host.dispatch("click bad%2");
    assert_eq!(response.kind, "click");
    assert!(response.error.is_some());
}

#[test]
fn encoded_space_reaches_handler_as_one_argument() {
    let host = Host::ephemeral(true);

    let label = encode_argument("Get started");
    let responses = run_lines(
        &host,
        &[
            &format!("set_query_property main/getStarted label {label}"),
            "property main/getStarted label",
        ],
    );

    assert!(responses[0].error.is_none());
    assert_eq!(responses[1].value, Some(json!("Get started")));
}

#[test]
fn settings_round_trip_preserves_json_values() {
    let host = Host::ephemeral(false);

    let responses = run_lines(
        &host,
        &[
            "set_setting startAtBoot true",
            "setting startAtBoot",
            "set_setting languageCode en",
            "setting languageCode",
            "setting missing",
        ],
    );

    assert!(responses[0].error.is_none());
    assert_eq!(responses[1].value, Some(json!(true)));
    assert_eq!(responses[3].value, Some(json!("en")));
    assert!(responses[4].error.is_some());
}

#[test]
fn feature_flip_is_a_literal_toggle() {
    let host = Host::ephemeral(true);

    assert!(!host.state().features.is_supported("testFeatureAddonApi"));

    let response = host.dispatch("flip_on_feature testFeatureAddonApi");
    assert!(response.error.is_none());
    assert!(host.state().features.is_supported("testFeatureAddonApi"));
    assert_eq!(
        host.dispatch("is_feature_flipped_on testFeatureAddonApi").value,
        Some(json!(true))
    );

    // Flipping on again returns the feature to its default state.
    host.dispatch("flip_on_feature testFeatureAddonApi");
    assert!(!host.state().features.is_supported("testFeatureAddonApi"));
    assert_eq!(
        host.dispatch("is_feature_flipped_on testFeatureAddonApi").value,
        Some(json!(false))
    );
}

#[test]
fn unknown_feature_is_rejected() {
    let host = Host::ephemeral(true);

    let response = host.dispatch("flip_on_feature doesNotExist");
    assert_eq!(response.error.as_deref(), Some("feature does not exist"));
}

#[test]
fn force_update_check_compares_versions() {
    let host = Host::ephemeral(true);
    host.dispatch("set_version_override 2.10.0");

    assert_eq!(
        host.dispatch("force_update_check 2.11.1").value,
        Some(json!(true))
    );
    assert_eq!(
        host.dispatch("force_update_check 2.10.0").value,
        Some(json!(false))
    );
    assert_eq!(
        host.dispatch("force_update_check 2.9.9").value,
        Some(json!(false))
    );

    // Fewer than three components never reaches the comparator.
    let response = host.dispatch("force_update_check 2.11");
    assert!(response.error.is_some());
}

#[test]
fn click_and_property_report_missing_elements() {
    let host = Host::ephemeral(true);

    assert_eq!(
        host.dispatch("click nowhere").error.as_deref(),
        Some("no object found")
    );
    assert_eq!(
        host.dispatch("property nowhere visible").error.as_deref(),
        Some("no object found")
    );
    assert_eq!(host.dispatch("query nowhere").value, Some(json!(false)));
}

#[test]
fn wildcard_segment_matches_any_child() {
    let host = Host::ephemeral(true);

    assert_eq!(
        host.dispatch("query main/*").value,
        Some(json!(true))
    );
    assert_eq!(
        host.dispatch("property */getHelpLink visible").value,
        Some(json!(true))
    );
}

#[test]
fn help_lists_every_command() {
    let host = Host::ephemeral(false);

    let response = host.dispatch("help");
    let listing = response.value.unwrap();
    let listing = listing.as_str().unwrap();
    for name in ["query", "set_setting", "flip_on_feature", "hard_reset", "tutorial"] {
        assert!(listing.contains(name), "help is missing {name}");
    }
}

#[test]
fn hard_reset_clears_settings_and_flips() {
    let host = Host::ephemeral(true);

    host.dispatch("set_setting languageCode de");
    host.dispatch("flip_on_feature testFeatureAddonApi");
    assert!(host.state().features.is_supported("testFeatureAddonApi"));

    let response = host.dispatch("hard_reset");
    assert!(response.error.is_none());
    assert!(host.state().setting("languageCode").is_none());
    assert!(!host.state().features.is_supported("testFeatureAddonApi"));
}

#[test]
fn controller_commands_drive_the_stub() {
    let host = Host::ephemeral(true);

    host.dispatch("activate");
    assert_eq!(host.state().controller_state().name(), "on");
    host.dispatch("deactivate");
    assert_eq!(host.state().controller_state().name(), "off");
}

#[test]
fn subscription_start_date_rewrites_stored_blob() {
    let host = Host::ephemeral(false);

    host.dispatch("set_subscription_start_date 1700000000");
    let data = host.state().subscription_data().unwrap();
    assert_eq!(
        data.created_at.map(|at| at.timestamp()),
        Some(1_700_000_000)
    );
}

proptest! {
    #[test]
    fn any_argument_survives_encode_then_parse(arg in "\\PC+") {
        let encoded = encode_argument(&arg);
        prop_assert!(encoded.is_ascii());
        let cmd = Command::parse(&format!("click {encoded}")).unwrap();
        prop_assert_eq!(cmd.args, vec![arg]);
    }

    #[test]
    fn dispatch_never_panics_on_arbitrary_lines(line in "[ -~]{0,80}") {
        let host = Host::ephemeral(false);
        let response = host.dispatch(&line);
        prop_assert!(!response.kind.is_empty());
        let _ = serde_json::to_string(&response).unwrap();
    }
}

#[test]
fn response_value_shapes_match_wire_contract() {
    let host = Host::ephemeral(true);

    // One response per command, always an object with a `type`.
    let raw = host.dispatch("languages");
    let value: Value = serde_json::to_value(&raw).unwrap();
    assert_eq!(value["type"], json!("languages"));
    assert!(value.get("error").is_none());
}
