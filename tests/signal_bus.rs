use hostpipe::Host;
use hostpipe::host::error::ScriptError;
use hostpipe::host::signal::{SignalBus, SignalHandler, SignalSource};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hostpipe::addon::api::AddonApi;
use hostpipe::addon::condition::{
    AttachContext, ConditionScript, EvalContext, ManualClock, ConditionEngine,
};
use hostpipe::host::error::ScriptResult;

fn record_handler(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> SignalHandler {
    let log = log.clone();
    let tag = tag.to_string();
    Arc::new(move |signal| {
        log.lock().push(format!("{tag}:{}", signal.name));
        Ok(())
    })
}

#[test]
fn delivery_follows_registration_order_within_one_pair() {
    let bus = SignalBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "a"));
    bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "b"));
    bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "c"));

    bus.publish(SignalSource::settings(), "key", None);

    assert_eq!(*log.lock(), vec!["a:key", "b:key", "c:key"]);
}

#[test]
fn unrelated_pairs_do_not_cross_deliver() {
    let bus = SignalBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "settings"));
    bus.subscribe(SignalSource::controller(), "key", record_handler(&log, "controller"));
    bus.subscribe(SignalSource::settings(), "other", record_handler(&log, "other"));

    bus.publish(SignalSource::settings(), "key", None);

    assert_eq!(*log.lock(), vec!["settings:key"]);
}

#[test]
fn subscription_added_during_publish_misses_the_inflight_signal() {
    let bus = Arc::new(SignalBus::new());
    let hits = Arc::new(AtomicUsize::new(0));

    let late_hits = hits.clone();
    let late: SignalHandler = Arc::new(move |_signal| {
        late_hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let bus_for_handler = bus.clone();
    let registrar: SignalHandler = Arc::new(move |_signal| {
        bus_for_handler.subscribe(SignalSource::settings(), "key", late.clone());
        Ok(())
    });
    bus.subscribe(SignalSource::settings(), "key", registrar);

    bus.publish(SignalSource::settings(), "key", None);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // The next pass reaches both the registrar's new subscriptions.
    bus.publish(SignalSource::settings(), "key", None);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_handler_does_not_block_later_handlers() {
    let bus = SignalBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let failing: SignalHandler =
        Arc::new(|_signal| Err(ScriptError::new("boom")));
    bus.subscribe(SignalSource::settings(), "key", failing);
    bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "after"));

    bus.publish(SignalSource::settings(), "key", None);

    assert_eq!(*log.lock(), vec!["after:key"]);
}

#[test]
fn unsubscribed_handlers_stop_receiving() {
    let bus = SignalBus::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let handle = bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "a"));
    bus.subscribe(SignalSource::settings(), "key", record_handler(&log, "b"));

    bus.publish(SignalSource::settings(), "key", None);
    assert!(bus.unsubscribe(&handle));
    assert!(!bus.unsubscribe(&handle));
    bus.publish(SignalSource::settings(), "key", None);

    assert_eq!(*log.lock(), vec!["a:key", "b:key", "b:key"]);
}

// A script whose evaluation fails must fail closed without disturbing the
// conditions of unrelated scripts sharing the same signal.
struct FlagScript {
    fail: Arc<Mutex<bool>>,
    value: bool,
}

impl ConditionScript for FlagScript {
    fn attach(&mut self, cx: &mut AttachContext) {
        cx.watch(SignalSource::settings(), "shared");
    }

    fn evaluate(&mut self, _cx: &mut EvalContext<'_>) -> ScriptResult<bool> {
        if *self.fail.lock() {
            return Err(ScriptError::new("deliberate failure"));
        }
        Ok(self.value)
    }
}

#[test]
fn failing_script_is_isolated_from_unrelated_conditions() {
    let host = Host::ephemeral(false);
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let engine = ConditionEngine::new(host.bus().clone(), clock);

    let fail_a = Arc::new(Mutex::new(false));
    let (_, condition_a) = engine.register(
        Box::new(FlagScript {
            fail: fail_a.clone(),
            value: true,
        }),
        AddonApi::new("addon-a", host.state().clone()),
        None,
    );
    let (_, condition_b) = engine.register(
        Box::new(FlagScript {
            fail: Arc::new(Mutex::new(false)),
            value: true,
        }),
        AddonApi::new("addon-b", host.state().clone()),
        None,
    );

    assert!(condition_a.is_enabled());
    assert!(condition_b.is_enabled());

    // Script A starts failing; the shared signal re-runs both.
    *fail_a.lock() = true;
    host.state().set_setting("shared", json!(1)).unwrap();

    assert!(!condition_a.is_enabled(), "failed evaluation must fail closed");
    assert!(condition_b.is_enabled(), "unrelated condition must be untouched");
}
