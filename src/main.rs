use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use log_playout::audio::SimulatedAudio;
use log_playout::audio_runtime::spawn_audio_runtime;
use log_playout::clock::{Clock, ManualClock, SystemClock};
use log_playout::config::{OpMode, PlayoutConfig};
use log_playout::control::{ControlHandle, OperatorCommand, control_channel, run_control_loop};
use log_playout::engine::{Collaborators, PlayoutEngine};
use log_playout::events::PlayoutEvent;
use log_playout::log_line::StartSource;
use log_playout::macros::LoggingMacroExecutor;
use log_playout::pad_socket::UnixPadPublisher;
use log_playout::restart::RestartState;
use log_playout::scheduler;
use log_playout::store::JsonLogStore;
use log_playout::traffic;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "logplay", about = "Log playout machine for radio automation")]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a log on the audio output, reading operator commands from stdin
    Run {
        /// Log name
        log: String,
        /// Operating mode (auto, live-assist, manual; overrides config)
        #[arg(short, long)]
        mode: Option<String>,
        /// Ignore any saved restart state
        #[arg(long)]
        fresh: bool,
    },
    /// Show a log with predicted start times
    Show {
        /// Log name
        log: String,
        /// Pretend the clock reads this time (HH:MM or HH:MM:SS)
        #[arg(long)]
        at: Option<String>,
        /// Dry-run playout for this many seconds without audio
        #[arg(long)]
        simulate: Option<u64>,
    },
    /// List logs in the log directory
    Logs,
    /// Summarize an as-played traffic file
    Traffic {
        /// Traffic file (JSON lines)
        file: PathBuf,
    },
    /// Machine configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Show the effective configuration
    Show,
    /// Write a default config file if none exists
    Init,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("log_playout=info,logplay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(PlayoutConfig::default_path);
    let config = PlayoutConfig::load_from(&config_path);

    let result = match cli.command {
        Commands::Run { log, mode, fresh } => cmd_run(config, &log, mode.as_deref(), fresh),
        Commands::Show { log, at, simulate } => cmd_show(config, &log, at.as_deref(), simulate),
        Commands::Logs => {
            let store = JsonLogStore::new(&config.log_dir);
            let names = store.list();
            if names.is_empty() {
                println!("No logs in {}.", config.log_dir.display());
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Traffic { file } => {
            let records = traffic::read_records(&file);
            println!("{} records in {}", records.len(), file.display());
            println!("{:<8} {:<6} Title", "Cart", "Starts");
            println!("{}", "-".repeat(60));
            for c in traffic::play_counts(&records) {
                println!("{:<8} {:<6} {}", c.cart, c.starts, c.title);
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            ConfigCmd::Show => serde_json::to_string_pretty(&config)
                .map(|json| println!("{json}"))
                .context("serializing config"),
            ConfigCmd::Init => {
                if config_path.exists() {
                    println!("Config already exists at {}", config_path.display());
                    Ok(())
                } else {
                    config
                        .save_to(&config_path)
                        .map(|_| println!("Wrote {}", config_path.display()))
                        .context("writing config")
                }
            }
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn build_engine(
    config: PlayoutConfig,
    audio: Box<dyn log_playout::audio::AudioEngine>,
    clock: Box<dyn Clock>,
    macros: Box<dyn log_playout::macros::MacroExecutor>,
) -> anyhow::Result<PlayoutEngine> {
    let store = JsonLogStore::new(&config.log_dir);
    let engine = PlayoutEngine::new(
        config,
        Collaborators {
            audio,
            macros,
            store: Box::new(store),
            clock,
        },
    )?;
    Ok(engine)
}

fn cmd_run(mut config: PlayoutConfig, log: &str, mode: Option<&str>, fresh: bool) -> anyhow::Result<()> {
    if let Some(m) = mode {
        config.op_mode = OpMode::from_str_loose(m).map_err(anyhow::Error::msg)?;
    }
    let pad_path = config.pad_socket.clone();
    let restart_path = config.restart_state.clone();

    let (handle, rx) = control_channel();
    let deck_tx = handle.clone();
    let audio = spawn_audio_runtime(move |ev| deck_tx.deck_event(ev))?;
    let macro_tx = handle.clone();
    let macros = LoggingMacroExecutor::new(move |ev| macro_tx.macro_event(ev));

    let mut engine = build_engine(config, Box::new(audio.clone()), Box::new(SystemClock), Box::new(macros))?;
    if let Some(path) = pad_path {
        match UnixPadPublisher::bind(&path) {
            Ok(publisher) => engine.set_pad_sink(Box::new(publisher)),
            Err(e) => eprintln!("Warning: PAD socket {} unavailable: {}", path.display(), e),
        }
    }

    let saved = restart_path
        .as_deref()
        .filter(|_| !fresh)
        .and_then(RestartState::load)
        .filter(|s| s.log_name == log);
    match saved {
        Some(state) => {
            println!("Resuming '{}' after restart.", log);
            engine.restore(&state)?;
        }
        None => engine.load(log).with_context(|| format!("loading log '{log}'"))?,
    }
    println!(
        "Loaded '{}' ({} lines, mode {}). Type 'help' for commands.",
        log,
        engine.line_count(),
        engine.op_mode()
    );

    let input = handle.clone();
    std::thread::Builder::new()
        .name("operator-input".into())
        .spawn(move || read_operator_input(input))?;

    run_control_loop(&mut engine, rx, print_event);
    engine.stop(true);
    audio.shutdown();
    Ok(())
}

const HELP: &str = "\
Commands (line numbers are 1-based):
  play N [CH]    start line N, optionally on channel CH (1 or 2)
  stop [N]       stop line N, or everything
  pause N        pause line N
  next N         make line N next
  head N/tail N  audition the start or end of line N
  astop          stop the audition
  resync         reconcile with the stored log
  refresh        check the stored log for edits
  pad            republish now/next
  mode M         auto, live-assist or manual
  status         show what is playing
  quit";

fn read_operator_input(handle: ControlHandle) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            continue;
        };
        match parse_operator_command(verb, args) {
            Ok(Some(cmd)) => handle.command(cmd),
            Ok(None) => match verb {
                "quit" | "exit" => break,
                "status" => match handle.status() {
                    Some(s) => print_status(&s),
                    None => break,
                },
                "resync" => match handle.resync() {
                    Some(r) => println!(
                        "Resync: {} unchanged, {} replaced, {} added, {} removed, {} deferred",
                        r.unchanged, r.replaced, r.added, r.removed, r.deferred
                    ),
                    None => println!("Resync failed."),
                },
                _ => println!("{HELP}"),
            },
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    handle.shutdown();
}

fn line_arg(args: &[&str], i: usize) -> anyhow::Result<usize> {
    let raw = args.get(i).context("missing line number")?;
    let n: usize = raw.parse().with_context(|| format!("'{raw}' is not a line number"))?;
    if n == 0 {
        bail!("line numbers are 1-based");
    }
    Ok(n - 1)
}

fn parse_operator_command(verb: &str, args: &[&str]) -> anyhow::Result<Option<OperatorCommand>> {
    let cmd = match verb {
        "play" => OperatorCommand::Play {
            line: line_arg(args, 0)?,
            channel: match args.get(1) {
                Some(_) => Some(line_arg(args, 1)?),
                None => None,
            },
        },
        "stop" if args.is_empty() => OperatorCommand::StopAll,
        "stop" => OperatorCommand::Stop {
            line: line_arg(args, 0)?,
        },
        "pause" => OperatorCommand::Pause {
            line: line_arg(args, 0)?,
        },
        "next" => OperatorCommand::MakeNext {
            line: line_arg(args, 0)?,
        },
        "head" => OperatorCommand::AuditionHead {
            line: line_arg(args, 0)?,
        },
        "tail" => OperatorCommand::AuditionTail {
            line: line_arg(args, 0)?,
        },
        "astop" => OperatorCommand::AuditionStop,
        "refresh" => OperatorCommand::Refresh,
        "pad" => OperatorCommand::SendNowNext,
        "mode" => {
            let m = args.first().context("missing mode")?;
            OperatorCommand::SetMode(OpMode::from_str_loose(m).map_err(anyhow::Error::msg)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(cmd))
}

fn print_status(s: &log_playout::engine::StatusSnapshot) {
    println!(
        "Log '{}' | mode {} | {} | next {} | next stop {}",
        s.log,
        s.mode,
        if s.running { "running" } else { "stopped" },
        s.next.map_or("-".to_string(), |n| (n + 1).to_string()),
        s.next_stop.map_or("-".to_string(), |t| t.format("%H:%M:%S").to_string()),
    );
    for l in &s.active {
        println!("  {:>4}. [{}] {} (cart {})", l.line + 1, l.status, l.title, l.cart);
    }
}

fn print_event(event: &PlayoutEvent) {
    match event {
        PlayoutEvent::Position { .. } | PlayoutEvent::TransportChanged => {}
        PlayoutEvent::Played { line } => println!("▶ line {}", line + 1),
        PlayoutEvent::Stopped { line } => println!("■ line {}", line + 1),
        PlayoutEvent::PlayFailed { line, reason } => eprintln!("✗ line {}: {}", line + 1, reason),
        PlayoutEvent::LateStart { line, scheduled, start } => println!(
            "! line {} late: scheduled {}, starting {}",
            line + 1,
            scheduled.format("%H:%M:%S"),
            start.format("%H:%M:%S")
        ),
        other => tracing::debug!("{}", serde_json::to_string(other).unwrap_or_default()),
    }
}

fn cmd_show(config: PlayoutConfig, log: &str, at: Option<&str>, simulate: Option<u64>) -> anyhow::Result<()> {
    let start = match at {
        Some(t) => scheduler::parse_time(t).map_err(anyhow::Error::msg)?,
        None => SystemClock.now(),
    };
    let clock = ManualClock::at(start);
    let audio = SimulatedAudio::new();
    let mut engine = build_engine(
        config,
        Box::new(audio.clone()),
        Box::new(clock.clone()),
        Box::new(LoggingMacroExecutor::new(|_| {})),
    )?;
    engine.load(log).with_context(|| format!("loading log '{log}'"))?;

    if let Some(secs) = simulate {
        if let Some(first) = engine.next_event() {
            engine.play(first, StartSource::Manual, None, false)?;
        }
        let step = Duration::from_millis(100);
        for _ in 0..secs * 10 {
            for cb in audio.take_callbacks() {
                engine.handle_deck_event(cb);
            }
            clock.advance(step);
            audio.advance(step);
            for cb in audio.take_callbacks() {
                engine.handle_deck_event(cb);
            }
            engine.tick();
            for event in engine.drain_events() {
                if !matches!(event, PlayoutEvent::Position { .. }) {
                    println!("{}  {}", clock.now().format("%H:%M:%S%.3f"), serde_json::to_string(&event)?);
                }
            }
        }
        println!();
    }

    println!("Log '{}' at {}", log, clock.now().format("%H:%M:%S"));
    println!("{:<5} {:<10} {:<8} {:<8} {:<9} Title", "#", "Status", "Trans", "Start", "Length");
    println!("{}", "-".repeat(70));
    for (i, l) in engine.log().lines.iter().enumerate() {
        let start = l
            .runtime
            .start_time
            .map_or("--:--:--".to_string(), |t| t.format("%H:%M:%S").to_string());
        println!(
            "{:<5} {:<10} {:<8} {:<8}{} {:<9} {}",
            i + 1,
            l.status().to_string(),
            l.trans_type.to_string(),
            start,
            if l.runtime.late { "!" } else { " " },
            l.length_display(),
            l.cart.title
        );
    }
    if let Some(stop) = engine.next_stop() {
        println!("\nNext stop: {}", stop.format("%H:%M:%S"));
    }
    Ok(())
}
