//! `hostpiped` – command-channel daemon built on the hostpipe host.

use hostpipe::host::ws;
use hostpipe::{Host, HostConfig};
use std::env;
use std::io::{self, BufReader, BufWriter};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn main() -> io::Result<()> {
    // Responses own stdout in stdio mode; keep diagnostics on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let mut root: Option<PathBuf> = None;
    let mut testing = false;
    let mut listen_addr: Option<String> = None;
    let mut ws_addr: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--root" => {
                let path = match args.next() {
                    Some(path) => path,
                    None => {
                        eprintln!("--root requires a path argument");
                        print_usage();
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "missing value for --root",
                        ));
                    }
                };
                root = Some(PathBuf::from(path));
            }
            "--testing" => {
                testing = true;
            }
            "--stdio" => {
                // Stdio is the default transport; accept the flag for compatibility.
            }
            "--listen" => {
                let addr = match args.next() {
                    Some(addr) => addr,
                    None => {
                        eprintln!("--listen requires an address argument");
                        print_usage();
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "missing value for --listen",
                        ));
                    }
                };
                listen_addr = Some(addr);
            }
            "--ws" => {
                let addr = match args.next() {
                    Some(addr) => addr,
                    None => {
                        eprintln!("--ws requires an address argument");
                        print_usage();
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "missing value for --ws",
                        ));
                    }
                };
                ws_addr = Some(addr);
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid command-line argument",
                ));
            }
        }
    }

    let mut config = HostConfig::default();
    if let Some(root_path) = root {
        config.root = root_path;
    }
    config.testing = testing;

    let host = Arc::new(Host::new(config).map_err(to_io_error)?);

    // Condition timers fire from their own thread; each channel only
    // observes the resulting state.
    {
        let host = host.clone();
        std::thread::spawn(move || {
            loop {
                host.pump_timers();
                std::thread::sleep(Duration::from_millis(100));
            }
        });
    }

    if let Some(addr) = ws_addr {
        return run_ws(host, &addr);
    }

    if let Some(addr) = listen_addr {
        return run_tcp(host, &addr);
    }

    run_stdio(host)
}

fn run_stdio(host: Arc<Host>) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let reader = stdin.lock();
    let writer = BufWriter::new(stdout.lock());

    host.handle(reader, writer)
}

fn run_tcp(host: Arc<Host>, addr: &str) -> io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    let actual = listener.local_addr()?;
    eprintln!("hostpiped listening on {}", actual);

    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                let reader = BufReader::new(stream.try_clone()?);
                let writer = BufWriter::new(stream);
                if let Err(err) = host.handle(reader, writer) {
                    eprintln!("connection error from {:?}: {}", peer, err);
                }
            }
            Err(err) => {
                eprintln!("failed to accept connection: {err}");
            }
        }
    }

    Ok(())
}

fn run_ws(host: Arc<Host>, addr: &str) -> io::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime
        .block_on(ws::serve(host, addr))
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn print_usage() {
    eprintln!(
        "Usage: hostpiped [--root PATH] [--testing] [--stdio] [--listen ADDR] [--ws ADDR]\n\
         \n\
         Options:\n\
           --root PATH   Settings root directory (default: .hostpipe)\n\
           --testing     Seed the testing element tree and test features\n\
           --stdio       Communicate over stdin/stdout (default)\n\
           --listen ADDR Listen on TCP ADDR instead of stdio\n\
           --ws ADDR     Serve the WebSocket channel on ADDR instead of stdio\n"
    );
}

fn to_io_error(error: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error.to_string())
}
