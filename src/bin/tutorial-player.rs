//! Tutorial player – drives a tutorial against a hostpipe host.
//!
//! Spawns the host in testing mode (or connects to a running one), waits
//! for the main view, loads the tutorial, then clicks through every step.
//! Any command failure aborts the run with a non-zero exit; the spawned
//! host dies with the player.

use clap::Parser;
use hostpipe::driver::{ClientError, DriverClient};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tutorial-player")]
#[command(about = "Plays a tutorial file against a hostpipe host", long_about = None)]
struct Cli {
    /// Host binary to spawn in testing mode
    #[arg(long, default_value = "hostpiped")]
    path: PathBuf,

    /// Connect to an already-running host (TCP address) instead of spawning
    #[arg(long)]
    connect: Option<String>,

    /// Seconds to wait for host readiness
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Tutorial manifest to play
    tutorial: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tutorial-player: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ClientError> {
    let timeout = Duration::from_secs(cli.timeout);

    let mut client = match &cli.connect {
        Some(addr) => DriverClient::connect_tcp(addr.as_str())?,
        None => {
            let command: Vec<OsString> = vec![
                cli.path.clone().into_os_string(),
                OsString::from("--testing"),
                OsString::from("--stdio"),
            ];
            DriverClient::connect_stdio(command.into_iter())?
        }
    };

    // The testing seed registers the main view; its presence means the
    // host is ready for commands.
    client.wait_for_element("main", timeout)?;

    let tutorial_path = cli.tutorial.to_string_lossy().into_owned();
    client.issue("tutorial", &[&tutorial_path])?;

    // An empty tutorial completes before its playback element ever shows.
    if client.query("tutorial")? {
        let step_count = client
            .property("tutorial", "stepCount")?
            .as_u64()
            .unwrap_or(0);

        for _ in 0..step_count {
            if !client.query("tutorial")? {
                break;
            }
            let step_element = client.property("tutorial", "stepElement")?;
            let Some(step_element) = step_element.as_str().map(String::from) else {
                break;
            };
            tracing::info!(element = %step_element, "clicking step target");
            client.click(&step_element)?;
        }

        if client.query("tutorial")? {
            return Err(ClientError::Protocol(
                "tutorial did not complete after clicking every step".to_string(),
            ));
        }
    }

    println!("tutorial completed");
    Ok(())
}
