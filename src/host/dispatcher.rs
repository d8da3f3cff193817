//! Command table and dispatch.
//!
//! Dispatch is intentionally conservative: commands resolve against a fixed
//! table, arity is checked before the handler runs, and every line in
//! produces exactly one [`Response`] out: handler outcomes are mapped, never
//! swallowed or duplicated. Handlers are free to mutate host state; anything
//! long-running (waiting for an element to appear) belongs in the driver's
//! polling loop, not here.

use serde_json::{Value, json};
use std::path::Path;

use super::command::{Command, Response};
use super::signal::SignalSource;
use super::state::{ControllerState, INSTALLATION_TIME_KEY};
use crate::host::Host;
use crate::util::version::Version;

type CommandOutcome = std::result::Result<Option<Value>, String>;

/// One entry of the command table.
pub struct CommandDef {
    /// Wire name.
    pub name: &'static str,
    /// One-line description for `help`.
    pub description: &'static str,
    /// Exact number of arguments.
    pub args: usize,
    handler: fn(&Host, &[String]) -> CommandOutcome,
}

/// The full command table.
pub static COMMANDS: &[CommandDef] = &[
    CommandDef {
        name: "help",
        description: "The help menu",
        args: 0,
        handler: cmd_help,
    },
    CommandDef {
        name: "query",
        description: "Check whether an element matches the query path",
        args: 1,
        handler: cmd_query,
    },
    CommandDef {
        name: "property",
        description: "Read a property off a matched element",
        args: 2,
        handler: cmd_property,
    },
    CommandDef {
        name: "set_query_property",
        description: "Write a property on a matched element",
        args: 3,
        handler: cmd_set_query_property,
    },
    CommandDef {
        name: "click",
        description: "Dispatch a click onto a matched element",
        args: 1,
        handler: cmd_click,
    },
    CommandDef {
        name: "set_setting",
        description: "Write a persisted setting",
        args: 2,
        handler: cmd_set_setting,
    },
    CommandDef {
        name: "setting",
        description: "Read a persisted setting",
        args: 1,
        handler: cmd_setting,
    },
    CommandDef {
        name: "reset",
        description: "Clear session state",
        args: 0,
        handler: cmd_reset,
    },
    CommandDef {
        name: "hard_reset",
        description: "Clear session state, persisted settings, and addons",
        args: 0,
        handler: cmd_hard_reset,
    },
    CommandDef {
        name: "flip_on_feature",
        description: "Toggle a feature's flipped-on state",
        args: 1,
        handler: cmd_flip_on_feature,
    },
    CommandDef {
        name: "flip_off_feature",
        description: "Toggle a feature's flipped-off state",
        args: 1,
        handler: cmd_flip_off_feature,
    },
    CommandDef {
        name: "is_feature_flipped_on",
        description: "Check a feature's flipped-on state",
        args: 1,
        handler: cmd_is_feature_flipped_on,
    },
    CommandDef {
        name: "is_feature_flipped_off",
        description: "Check a feature's flipped-off state",
        args: 1,
        handler: cmd_is_feature_flipped_off,
    },
    CommandDef {
        name: "force_update_check",
        description: "Simulate an update check against a candidate version",
        args: 1,
        handler: cmd_force_update_check,
    },
    CommandDef {
        name: "languages",
        description: "Returns the list of available languages",
        args: 0,
        handler: cmd_languages,
    },
    CommandDef {
        name: "back_button_clicked",
        description: "Simulate the back navigation input",
        args: 0,
        handler: cmd_back_button_clicked,
    },
    CommandDef {
        name: "activate",
        description: "Drive the controller to the on state",
        args: 0,
        handler: cmd_activate,
    },
    CommandDef {
        name: "deactivate",
        description: "Drive the controller to the off state",
        args: 0,
        handler: cmd_deactivate,
    },
    CommandDef {
        name: "set_version_override",
        description: "Override the client version string",
        args: 1,
        handler: cmd_set_version_override,
    },
    CommandDef {
        name: "set_subscription_start_date",
        description: "Change the start date of the stored subscription",
        args: 1,
        handler: cmd_set_subscription_start_date,
    },
    CommandDef {
        name: "set_installation_time",
        description: "Set the installation time",
        args: 1,
        handler: cmd_set_installation_time,
    },
    CommandDef {
        name: "lasturl",
        description: "Retrieve the last URL a script opened",
        args: 0,
        handler: cmd_lasturl,
    },
    CommandDef {
        name: "load_addon",
        description: "Load an addon manifest from a file path",
        args: 1,
        handler: cmd_load_addon,
    },
    CommandDef {
        name: "tutorial",
        description: "Load a tutorial manifest and start playing it",
        args: 1,
        handler: cmd_tutorial,
    },
];

/// Resolve and run one command line, producing exactly one response.
pub fn dispatch(host: &Host, raw: &str) -> Response {
    let command = match Command::parse(raw) {
        Ok(command) => command,
        Err(err) => return Response::failure(err.name, err.detail),
    };

    let Some(def) = COMMANDS.iter().find(|def| def.name == command.name) else {
        return Response::failure(command.name, "invalid command");
    };

    if command.args.len() != def.args {
        return Response::failure(
            def.name,
            format!("wrong number of arguments ({} expected)", def.args),
        );
    }

    tracing::debug!(command = def.name, "command received");
    match (def.handler)(host, &command.args) {
        Ok(Some(value)) => Response::success(def.name, value),
        Ok(None) => Response::empty(def.name),
        Err(error) => {
            tracing::debug!(command = def.name, "command failed: {error}");
            Response::failure(def.name, error)
        }
    }
}

// Setting and element property values arrive as text; accept JSON literals
// so booleans and numbers survive, falling back to a plain string.
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn cmd_help(_host: &Host, _args: &[String]) -> CommandOutcome {
    let mut listing = String::new();
    for def in COMMANDS {
        listing.push_str(def.name);
        listing.push('\t');
        listing.push_str(def.description);
        listing.push('\n');
    }
    Ok(Some(json!(listing)))
}

fn cmd_query(host: &Host, args: &[String]) -> CommandOutcome {
    Ok(Some(json!(host.state().elements.query(&args[0]))))
}

fn cmd_property(host: &Host, args: &[String]) -> CommandOutcome {
    if !host.state().elements.query(&args[0]) {
        return Err("no object found".to_string());
    }
    host.state()
        .elements
        .property(&args[0], &args[1])
        .map(Some)
        .ok_or_else(|| format!("property '{}' not found", args[1]))
}

fn cmd_set_query_property(host: &Host, args: &[String]) -> CommandOutcome {
    let value = parse_value(&args[2]);
    if host.state().set_element_property(&args[0], &args[1], value) {
        Ok(None)
    } else {
        Err("no object found".to_string())
    }
}

fn cmd_click(host: &Host, args: &[String]) -> CommandOutcome {
    if host.state().click_element(&args[0]) {
        Ok(None)
    } else {
        Err("no object found".to_string())
    }
}

fn cmd_set_setting(host: &Host, args: &[String]) -> CommandOutcome {
    host.state()
        .set_setting(&args[0], parse_value(&args[1]))
        .map(|()| None)
        .map_err(|err| err.to_string())
}

fn cmd_setting(host: &Host, args: &[String]) -> CommandOutcome {
    host.state()
        .setting(&args[0])
        .map(Some)
        .ok_or_else(|| format!("setting '{}' not found", args[0]))
}

fn cmd_reset(host: &Host, _args: &[String]) -> CommandOutcome {
    host.reset();
    Ok(None)
}

fn cmd_hard_reset(host: &Host, _args: &[String]) -> CommandOutcome {
    host.hard_reset().map(|()| None).map_err(|err| err.to_string())
}

fn cmd_flip_on_feature(host: &Host, args: &[String]) -> CommandOutcome {
    if !host.state().features.exists(&args[0]) {
        return Err("feature does not exist".to_string());
    }
    host.state().flip_feature_on(&args[0]);
    Ok(None)
}

fn cmd_flip_off_feature(host: &Host, args: &[String]) -> CommandOutcome {
    if !host.state().features.exists(&args[0]) {
        return Err("feature does not exist".to_string());
    }
    host.state().flip_feature_off(&args[0]);
    Ok(None)
}

fn cmd_is_feature_flipped_on(host: &Host, args: &[String]) -> CommandOutcome {
    if !host.state().features.exists(&args[0]) {
        return Err("feature does not exist".to_string());
    }
    Ok(Some(json!(host.state().features.is_flipped_on(&args[0]))))
}

fn cmd_is_feature_flipped_off(host: &Host, args: &[String]) -> CommandOutcome {
    if !host.state().features.exists(&args[0]) {
        return Err("feature does not exist".to_string());
    }
    Ok(Some(json!(host.state().features.is_flipped_off(&args[0]))))
}

fn cmd_force_update_check(host: &Host, args: &[String]) -> CommandOutcome {
    // Malformed versions take the conservative path: the comparator is
    // never consulted and no update notification fires.
    let Some(candidate) = Version::parse(&args[0]) else {
        return Err(format!("invalid version string '{}'", args[0]));
    };
    let Some(current) = Version::parse(&host.state().effective_version()) else {
        return Err("client version is not comparable".to_string());
    };

    let recommended = candidate > current;
    if recommended {
        host.state().bus().publish(
            SignalSource::new("releaseMonitor"),
            "updateRecommended",
            Some(json!(args[0])),
        );
    }
    Ok(Some(json!(recommended)))
}

fn cmd_languages(host: &Host, _args: &[String]) -> CommandOutcome {
    Ok(Some(json!(host.state().languages())))
}

fn cmd_back_button_clicked(host: &Host, _args: &[String]) -> CommandOutcome {
    host.state()
        .bus()
        .publish(SignalSource::navigator(), "backButtonClicked", None);
    Ok(None)
}

fn cmd_activate(host: &Host, _args: &[String]) -> CommandOutcome {
    host.state().set_controller_state(ControllerState::On);
    Ok(None)
}

fn cmd_deactivate(host: &Host, _args: &[String]) -> CommandOutcome {
    host.state().set_controller_state(ControllerState::Off);
    Ok(None)
}

fn cmd_set_version_override(host: &Host, args: &[String]) -> CommandOutcome {
    host.state().set_version_override(Some(args[0].clone()));
    Ok(None)
}

fn cmd_set_subscription_start_date(host: &Host, args: &[String]) -> CommandOutcome {
    let created_secs: i64 = args[0]
        .parse()
        .map_err(|_| format!("invalid timestamp '{}'", args[0]))?;
    host.state()
        .set_subscription_created(created_secs)
        .map(|()| None)
        .map_err(|err| err.to_string())
}

fn cmd_set_installation_time(host: &Host, args: &[String]) -> CommandOutcome {
    let secs: i64 = args[0]
        .parse()
        .map_err(|_| format!("invalid timestamp '{}'", args[0]))?;
    host.state()
        .set_setting(INSTALLATION_TIME_KEY, json!(secs))
        .map(|()| None)
        .map_err(|err| err.to_string())
}

fn cmd_lasturl(host: &Host, _args: &[String]) -> CommandOutcome {
    Ok(Some(json!(host.state().last_url().unwrap_or_default())))
}

fn cmd_load_addon(host: &Host, args: &[String]) -> CommandOutcome {
    host.addons()
        .load_from_path(Path::new(&args[0]))
        .map(|id| Some(json!(id)))
        .map_err(|err| err.to_string())
}

fn cmd_tutorial(host: &Host, args: &[String]) -> CommandOutcome {
    let id = host
        .addons()
        .load_from_path(Path::new(&args[0]))
        .map_err(|err| err.to_string())?;
    host.addons()
        .start_tutorial(&id)
        .map(|()| None)
        .map_err(|err| err.to_string())
}
