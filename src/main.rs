// main.rs — entry point: CLI, config, core bootstrap, agent server lifecycle

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use m64agent::completion::CompletionBoard;
use m64agent::config::{largest_4x3, AgentProfile, Config};
use m64agent::core::{Core, DummyCore, EmuState};
use m64agent::input::InputShadow;
use m64agent::server::AgentServer;

/// N64 emulator console front-end with an automation control server.
#[derive(Debug, Parser)]
#[command(name = "m64agent", version)]
struct Args {
    /// ROM image to run
    rom: Option<PathBuf>,

    /// Enable the JSON agent server on a unix socket endpoint
    /// (`unix:<path>` or a bare filesystem path); forces windowed mode
    #[arg(long = "agent-server", value_name = "ENDPOINT")]
    agent_server: Option<String>,

    /// Startup preset for automation clients: watch|train
    #[arg(long = "agent-profile", value_name = "MODE")]
    agent_profile: Option<String>,

    /// Configuration file (default: $XDG_CONFIG_HOME/m64agent/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,
}

// exit code when the server could not be started after a successful
// core bootstrap
const EXIT_AGENT_START_FAILED: u8 = 15;

fn apply_profile(profile: AgentProfile, config: &mut Config, core: &dyn Core) {
    match profile {
        AgentProfile::Watch => {
            config.osd = true;
            if core.set_speed_limiter(true).is_err() {
                tracing::warn!("failed to apply watch profile speed limiter setting");
            }
            tracing::info!("applied agent profile: watch (OSD on, speed limiter on)");
        }
        AgentProfile::Train => {
            config.osd = false;
            if core.set_speed_limiter(false).is_err() {
                tracing::warn!("failed to apply train profile speed limiter setting");
            }
            tracing::info!("applied agent profile: train (OSD off, speed limiter off)");
        }
    }
}

/// Block until the core stops or the agent requests shutdown. The real
/// front-end parks in the core's execute call here; the development core
/// just runs until told otherwise.
fn run_emulation(core: &dyn Core, stop: &AtomicBool) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match core.emu_state() {
            Ok(EmuState::Stopped) | Err(_) => break,
            _ => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(level)
        .init();

    let mut config = Config::load(args.config.as_deref());

    let endpoint = args
        .agent_server
        .or_else(|| config.agent.endpoint.clone());
    let profile = args
        .agent_profile
        .or_else(|| config.agent.profile.clone())
        .and_then(|s| AgentProfile::parse(&s));

    if let Some(rom) = &args.rom {
        tracing::info!("ROM image: {}", rom.display());
    }

    // Core bootstrap. The development core stands in for the emulator
    // library; a production front-end attaches the real core behind the
    // same trait and hands it the same callbacks.
    let core = Arc::new(DummyCore::new());

    if endpoint.is_some() {
        // agent mode always runs windowed at the largest 4:3 fit
        let (w, h) = largest_4x3(config.desktop_width, config.desktop_height);
        core.set_video_size(w, h);
        tracing::info!("agent mode window size set to {w}x{h} (max 4:3 within display)");
    }

    if let Some(profile) = profile {
        apply_profile(profile, &mut config, core.as_ref());
    } else if core.set_speed_limiter(config.speed_limiter).is_err() {
        tracing::warn!("failed to apply configured speed limiter setting");
    }

    let shadow = Arc::new(InputShadow::new());
    let board = Arc::new(CompletionBoard::new());
    core.set_event_sink(board.clone());

    let Some(endpoint) = endpoint else {
        tracing::info!("no agent endpoint configured — running without a control server");
        run_emulation(core.as_ref(), &AtomicBool::new(false));
        return ExitCode::SUCCESS;
    };

    let mut server = match AgentServer::start(&endpoint, core.clone(), shadow, board) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("failed to start agent server: {e}");
            return ExitCode::from(EXIT_AGENT_START_FAILED);
        }
    };

    let stop = server.stop_flag();
    run_emulation(core.as_ref(), &stop);

    server.stop();
    ExitCode::SUCCESS
}
