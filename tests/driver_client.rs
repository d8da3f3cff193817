use hostpipe::Host;
use hostpipe::driver::{ClientError, DriverClient};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn spawn_host(host: Arc<Host>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let reader = BufReader::new(stream.try_clone().unwrap());
            let writer = BufWriter::new(stream);
            let _ = host.handle(reader, writer);
        }
    });
    addr
}

/// Fake host answering each line with a fixed sequence of raw frames.
fn spawn_scripted_server(frames: Vec<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let mut line = String::new();
            if reader.read_line(&mut line).is_ok() {
                for frame in &frames {
                    let _ = writeln!(writer, "{frame}");
                }
                let _ = writer.flush();
            }
        }
    });
    addr
}

#[test]
fn commands_resolve_serially_with_type_echo() {
    let host = Arc::new(Host::ephemeral(true));
    let addr = spawn_host(host);

    let mut client = DriverClient::connect_tcp(addr).unwrap();
    assert!(client.query("main").unwrap());
    assert!(!client.query("nowhere").unwrap());

    client.set_setting("greeting", "hello world").unwrap();
    assert_eq!(
        client.issue("setting", &["greeting"]).unwrap(),
        json!("hello world")
    );

    let languages = client.issue("languages", &[]).unwrap();
    assert_eq!(languages, json!(["en", "de", "fr"]));
}

#[test]
fn feature_flip_round_trip_end_to_end() {
    let host = Arc::new(Host::ephemeral(true));
    let addr = spawn_host(host);

    let mut client = DriverClient::connect_tcp(addr).unwrap();

    client.flip_feature_on("testFeatureAddonApi").unwrap();
    assert_eq!(
        client
            .issue("is_feature_flipped_on", &["testFeatureAddonApi"])
            .unwrap(),
        Value::Bool(true)
    );

    // Toggling again returns to the default state.
    client.flip_feature_on("testFeatureAddonApi").unwrap();
    assert_eq!(
        client
            .issue("is_feature_flipped_on", &["testFeatureAddonApi"])
            .unwrap(),
        Value::Bool(false)
    );
}

#[test]
fn command_errors_are_recoverable() {
    let host = Arc::new(Host::ephemeral(true));
    let addr = spawn_host(host);

    let mut client = DriverClient::connect_tcp(addr).unwrap();

    let err = client.click("nowhere").unwrap_err();
    match &err {
        ClientError::Command { command, message } => {
            assert_eq!(command, "click");
            assert_eq!(message, "no object found");
        }
        other => panic!("expected command error, got {other:?}"),
    }
    assert!(err.is_recoverable());

    // The channel is still alive after a command error.
    assert!(client.query("main").unwrap());
}

#[test]
fn type_mismatch_is_a_fatal_protocol_violation() {
    let addr = spawn_scripted_server(vec![r#"{"type":"mismatch"}"#.to_string()]);

    let mut client = DriverClient::connect_tcp(addr).unwrap();
    let err = client.issue("query", &["main"]).unwrap_err();
    match &err {
        ClientError::Protocol(message) => assert!(message.contains("mismatch")),
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert!(!err.is_recoverable());
}

#[test]
fn out_of_band_frames_are_skipped_while_waiting() {
    let addr = spawn_scripted_server(vec![
        r#"{"type":"log","value":"chatter"}"#.to_string(),
        r#"{"type":"notification","value":"ping"}"#.to_string(),
        r#"{"type":"network","value":{}}"#.to_string(),
        r#"{"type":"query","value":true}"#.to_string(),
    ]);

    let mut client = DriverClient::connect_tcp(addr).unwrap();
    assert_eq!(client.issue("query", &["main"]).unwrap(), Value::Bool(true));
}

#[test]
fn channel_eof_mid_request_is_fatal() {
    let addr = spawn_scripted_server(Vec::new());

    let mut client = DriverClient::connect_tcp(addr).unwrap();
    let err = client.issue("query", &["main"]).unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)));
}

#[test]
fn polling_timeout_carries_the_last_observed_value() {
    let host = Arc::new(Host::ephemeral(true));
    let addr = spawn_host(host);

    let mut client = DriverClient::connect_tcp(addr).unwrap();
    let err = client
        .wait_for_element("neverAppears", Duration::from_millis(300))
        .unwrap_err();

    match err {
        ClientError::Timeout { waited, last } => {
            assert!(waited >= Duration::from_millis(300));
            assert_eq!(last, Some(Value::Bool(false)));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn waiting_for_a_property_sees_late_changes() {
    let host = Arc::new(Host::ephemeral(true));
    let addr = spawn_host(host.clone());

    let mut client = DriverClient::connect_tcp(addr).unwrap();

    let flipper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(250));
        host.state()
            .set_element_property("main/getStarted", "visible", json!(false));
    });

    client
        .wait_for_element_property(
            "main/getStarted",
            "visible",
            &json!(false),
            Duration::from_secs(5),
        )
        .unwrap();
    flipper.join().unwrap();
}
