//! `ws-echo`: an interactive WebSocket client over plain TCP.
//!
//! Connects to a `ws://` URI, sends every stdin line as a text message and
//! prints whatever the server sends back. End of input closes the connection
//! with 1000.
//!
//! Options:
//! - `--config` - TOML file with connection settings
//! - `--protocol` - Offer a subprotocol (repeatable)
//! - `--header` - Extra request header as `Name: value` (repeatable)
//! - `--ping-interval` - Seconds between keepalive pings (0 disables)
//! - `--poll-ms` - Transport poll interval
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use std::io::BufRead;
use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use websocket::{
    CloseCode, Connection, Event, HandshakeError, Message, Observer, ReadyState, TcpTransport,
    Transport, Uri, WsConfig, WsError,
};

#[derive(Parser, Debug)]
#[command(name = "ws-echo", version, about = "Interactive WebSocket client")]
struct Cli {
    /// Server URI, e.g. ws://localhost:8080/
    uri: String,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Subprotocol to offer (may be given several times)
    #[arg(long = "protocol")]
    protocols: Vec<String>,

    /// Extra request header as `Name: value` (may be given several times)
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Seconds between keepalive pings (0 disables)
    #[arg(long = "ping-interval", default_value = "0")]
    ping_interval: u64,

    /// Transport poll interval in milliseconds
    #[arg(long = "poll-ms", default_value = "50")]
    poll_ms: u64,
}

fn parse_header(arg: &str) -> Result<(String, String), String> {
    let (name, value) = arg
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got `{}`", arg))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{}`", arg));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Merge the config file (if any) with command-line overrides.
fn build_config(cli: &Cli) -> Result<WsConfig, WsError> {
    let mut config = match &cli.config {
        Some(path) => WsConfig::load(path)?,
        None => WsConfig::default(),
    };
    config.subprotocols.extend(cli.protocols.iter().cloned());
    config.headers.extend(cli.headers.iter().cloned());
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(ReadyState::Closed) => {}
        Ok(_) => process::exit(1),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

/// Parse the target URI. Only plain `ws://` is supported: this client has
/// no TLS transport, and `wss://` must never fall back to cleartext.
fn target_uri(cli: &Cli) -> Result<Uri, WsError> {
    let uri = Uri::parse(&cli.uri)?;
    if uri.secure {
        return Err(HandshakeError::InvalidUri {
            uri: cli.uri.clone(),
            reason: "wss:// needs TLS, which ws-echo does not provide",
        }
        .into());
    }
    Ok(uri)
}

fn run(cli: &Cli) -> Result<ReadyState, WsError> {
    let config = build_config(cli)?;
    let uri = target_uri(cli)?;
    let transport = TcpTransport::connect(&uri, Duration::from_millis(cli.poll_ms))?;

    let (events_tx, events) = unbounded();
    let mut conn = Connection::connect(&cli.uri, transport, events_tx, config)?;
    let lines = spawn_stdin_reader();
    let mut input = InputState {
        ping_every: (cli.ping_interval > 0).then(|| Duration::from_secs(cli.ping_interval)),
        last_ping: Instant::now(),
        done: false,
    };

    loop {
        let state = conn.run_once();
        print_events(&events);
        if state.is_terminal() {
            return Ok(state);
        }
        if state != ReadyState::Open {
            continue;
        }
        if let Err(e) = pump_input(&mut conn, &lines, &mut input) {
            // A failed write already emitted the error event.
            print_events(&events);
            return Err(e);
        }
    }
}

struct InputState {
    ping_every: Option<Duration>,
    last_ping: Instant,
    done: bool,
}

/// Send queued stdin lines, close on end of input, ping when due.
fn pump_input<T: Transport, O: Observer>(
    conn: &mut Connection<T, O>,
    lines: &Receiver<String>,
    input: &mut InputState,
) -> Result<(), WsError> {
    loop {
        match lines.try_recv() {
            Ok(line) => conn.send_text(&line)?,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                if !input.done {
                    input.done = true;
                    info!("end of input, closing");
                    conn.close(CloseCode::NORMAL, "bye")?;
                }
                break;
            }
        }
    }

    if let Some(every) = input.ping_every {
        if conn.ready_state() == ReadyState::Open && input.last_ping.elapsed() >= every {
            conn.ping(b"keepalive")?;
            input.last_ping = Instant::now();
        }
    }
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn print_events(events: &Receiver<Event>) {
    for event in events.try_iter() {
        match event {
            Event::Opened => info!("connected"),
            Event::MessageReceived(Message::Text(text)) => println!("{}", text),
            Event::MessageReceived(Message::Binary(data)) => {
                println!("<{} bytes of binary data>", data.len())
            }
            Event::Closing(info) => info!(code = info.code, reason = %info.reason, "closing"),
            Event::Closed(info) => info!(code = info.code, reason = %info.reason, "closed"),
            Event::Errored(err) => error!(code = err.code, kind = ?err.kind, "{}", err.message),
        }
    }
}
