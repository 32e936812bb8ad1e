use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use crossbeam_channel as cb;
use log::{info, warn};
use twinplay_core::console::Console;
use twinplay_core::controls::{Control, ControlChange, SAVE_STATE_SLOTS};
use twinplay_core::demo::DemoMachine;
use twinplay_core::machine::MemorySaveStateMedia;
use twinplay_core::standalone::StandaloneConsole;
use twinplay_link::config::{default_config_path, load_from_file};
use twinplay_link::{HostConsole, LinkConfig, LinkError, LinkEvent, RemoteConsole};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "twinplay", about = "Two-player link play for the demo console")]
struct Args {
    /// Path to link settings (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Exit after this many seconds instead of waiting for `quit`
    #[arg(long)]
    seconds: Option<u64>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Play alone, no network
    Solo,
    /// Run the console and wait for a second player
    Host {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Join a host as the second player
    Join {
        /// host[:port]
        address: String,
    },
}

#[derive(Debug, PartialEq)]
enum Command {
    Controls(Vec<ControlChange>),
    ToggleFast,
    Pause,
    Resume,
    Status,
    Quit,
}

fn press_and_release(control: Control) -> Command {
    Command::Controls(vec![
        ControlChange::state(control, true),
        ControlChange::state(control, false),
    ])
}

fn parse_slot(word: Option<&str>) -> Result<u8, String> {
    let slot = word
        .ok_or("missing slot number")?
        .parse::<u8>()
        .map_err(|e| format!("bad slot: {e}"))?;
    if slot >= SAVE_STATE_SLOTS {
        return Err(format!("slot must be below {SAVE_STATE_SLOTS}"));
    }
    Ok(slot)
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Err("empty command".to_string());
    };
    let second = words.next();

    let command = match first {
        "quit" | "exit" => Command::Quit,
        "status" => Command::Status,
        "pause" => Command::Pause,
        "resume" | "go" => Command::Resume,
        "fast" => Command::ToggleFast,
        "power" => press_and_release(Control::Power),
        "fry" => press_and_release(Control::PowerFry),
        "save" => press_and_release(Control::SaveState(parse_slot(second)?)),
        "load" => press_and_release(Control::LoadState(parse_slot(second)?)),
        "paddle" | "paddle0" | "paddle1" => {
            let control = if first == "paddle1" {
                Control::Paddle1
            } else {
                Control::Paddle0
            };
            let position = second
                .ok_or("missing paddle position")?
                .parse::<i32>()
                .map_err(|e| format!("bad paddle position: {e}"))?;
            Command::Controls(vec![ControlChange::position(control, position)])
        }
        name => {
            let control = Control::from_name(name).ok_or(format!("unknown command '{name}'"))?;
            let state = match second {
                None | Some("on") => true,
                Some("off") => false,
                Some(other) => return Err(format!("expected on/off, got '{other}'")),
            };
            Command::Controls(vec![ControlChange::state(control, state)])
        }
    };
    Ok(command)
}

enum Session {
    Solo(StandaloneConsole<DemoMachine>),
    Host(HostConsole<DemoMachine>),
    Join(RemoteConsole<DemoMachine>),
}

impl Session {
    fn open(
        mode: &Mode,
        config: &LinkConfig,
        events: cb::Sender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        match mode {
            Mode::Solo => {
                let solo = StandaloneConsole::new(DemoMachine::new())?;
                if let Some(mut console) = solo.console() {
                    console.set_save_state_media(Some(Box::new(MemorySaveStateMedia::new())));
                }
                Ok(Session::Solo(solo))
            }
            Mode::Host { port } => {
                let mut host = HostConsole::new(DemoMachine::new(), config, Some(events))?;
                host.set_save_state_media(Some(Box::new(MemorySaveStateMedia::new())));
                let bound = host.start(port.unwrap_or(config.port))?;
                println!("Hosting on port {bound}");
                Ok(Session::Host(host))
            }
            Mode::Join { address } => {
                let mut remote = RemoteConsole::new(DemoMachine::new(), config, Some(events));
                let addr = remote.connect(address)?;
                println!("Joined {addr}");
                Ok(Session::Join(remote))
            }
        }
    }

    fn apply(&self, change: ControlChange) {
        match self {
            Session::Solo(solo) => solo.apply(change),
            Session::Host(host) => host.apply(change),
            Session::Join(remote) => remote.apply(change),
        }
    }

    fn pause(&self) {
        match self {
            Session::Solo(solo) => solo.pause(),
            Session::Host(host) => host.clock().pause(),
            Session::Join(remote) => remote.pause(),
        }
    }

    fn resume(&self) {
        match self {
            Session::Solo(solo) => solo.go(),
            Session::Host(host) => host.clock().go(),
            Session::Join(remote) => remote.resume(),
        }
    }

    fn status(&self) -> String {
        let describe = |c: &Console<DemoMachine>| {
            format!(
                "power {} frame {} digest {:016x}",
                if c.is_powered() { "on" } else { "off" },
                c.machine().frame(),
                c.machine().digest()
            )
        };
        match self {
            Session::Solo(solo) => solo
                .console()
                .map(|c| describe(&c))
                .unwrap_or_default(),
            Session::Host(host) => format!(
                "[host {:?}] {}",
                host.connection_state(),
                host.with_console(describe).unwrap_or_default()
            ),
            Session::Join(remote) => format!(
                "[remote {:?}] {}",
                remote.connection_state(),
                remote.with_console(describe).unwrap_or_default()
            ),
        }
    }

    fn shutdown(self) {
        match self {
            Session::Solo(mut solo) => solo.terminate(),
            Session::Host(mut host) => host.terminate(),
            Session::Join(mut remote) => remote.disconnect(),
        }
    }
}

fn spawn_stdin_reader() -> cb::Receiver<String> {
    let (tx, rx) = cb::unbounded();
    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("failed to start stdin reader: {e}");
    }
    rx
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_from_file(&config_path);
    info!("Using link config {}", config_path.display());

    let (event_tx, event_rx) = cb::unbounded();
    let session = match Session::open(&args.mode, &config, event_tx) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let lines = spawn_stdin_reader();
    let closed = cb::never::<String>();
    let mut stdin_open = true;
    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let mut next_status = Instant::now() + STATUS_INTERVAL;
    let mut fast = false;

    loop {
        let wake = deadline.map_or(next_status, |d| d.min(next_status));
        cb::select! {
            recv(if stdin_open { &lines } else { &closed }) -> line => match line {
                Ok(line) => match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(Command::Status) => println!("{}", session.status()),
                    Ok(Command::Pause) => session.pause(),
                    Ok(Command::Resume) => session.resume(),
                    Ok(Command::ToggleFast) => {
                        fast = !fast;
                        session.apply(ControlChange::state(Control::FastSpeed, fast));
                    }
                    Ok(Command::Controls(changes)) => {
                        for change in changes {
                            session.apply(change);
                        }
                    }
                    Err(e) => eprintln!("{e}"),
                },
                // Stdin closed: keep running only if a deadline will end us.
                Err(_) if deadline.is_some() => stdin_open = false,
                Err(_) => break,
            },
            recv(event_rx) -> event => {
                if let Ok(event) = event {
                    println!("{event:?}");
                }
            },
            default(wake.saturating_duration_since(Instant::now())) => {}
        }

        let now = Instant::now();
        if now >= next_status {
            println!("{}", session.status());
            next_status = now + STATUS_INTERVAL;
        }
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
    }

    session.shutdown();
    ExitCode::SUCCESS
}
