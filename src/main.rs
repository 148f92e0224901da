//! Server binary: wires the clock, display backend, media source, script
//! runner, main loop and HTTP control plane together, then supervises.
//!
//! The supervisor thread (this one) waits for either a `/quit` command from
//! the control plane or a fatal fault escaping a player thread, and tears
//! the core down in order: stop the main loop, then the frame players.

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use crossbeam_channel::select;
use log::{debug, error, info};

use playout::cli::Args;
use playout::clock::{Clock, SystemClock};
use playout::display::DisplayDriver;
use playout::mainloop::{MainLoop, ScriptTick};
use playout::media::PatternSource;
use playout::runner::{RunnerContext, ScriptRunner};
use playout::server::{ApiCommand, ApiServer};
use playout::virtual_driver::VirtualDriver;

fn main() -> ExitCode {
    let args = Args::parse();

    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    info!("Playout server starting...");
    debug!("Command-line args: {:?}", args);

    let clock: Arc<dyn Clock> = SystemClock::new();
    let default_zero_time = clock.real();

    let driver: Arc<dyn DisplayDriver> = match args.dev.as_str() {
        "virtual" => Arc::new(VirtualDriver::new(Arc::clone(&clock))),
        other => {
            error!("Unknown display backend \"{}\" (available: virtual)", other);
            return ExitCode::FAILURE;
        }
    };

    if !args.media_root.is_dir() {
        error!("Media root is not a directory: {}", args.media_root.display());
        return ExitCode::FAILURE;
    }
    info!("Media root: {}", args.media_root.display());
    let media = Arc::new(PatternSource::new(&args.media_root));

    let (fault_tx, fault_rx) = crossbeam_channel::unbounded();
    let runner = match ScriptRunner::new(
        RunnerContext { clock: Arc::clone(&clock), driver, media, default_zero_time },
        fault_tx,
    ) {
        Ok(runner) => Arc::new(Mutex::new(runner)),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let tick_target: Arc<Mutex<dyn ScriptTick>> = runner.clone();
    let main_loop = MainLoop::start(Arc::clone(&clock), tick_target);
    let command_rx = ApiServer::start(
        args.port,
        args.trust_network,
        default_zero_time,
        Arc::clone(&runner),
        main_loop.handle(),
    );

    // Supervise until the control plane asks us to quit or a player thread
    // reports a fatal display fault.
    let exit = select! {
        recv(command_rx) -> command => match command {
            Ok(ApiCommand::Quit) => {
                info!("Quit requested, shutting down");
                ExitCode::SUCCESS
            }
            Err(_) => {
                error!("Control plane channel closed unexpectedly");
                ExitCode::FAILURE
            }
        },
        recv(fault_rx) -> fault => {
            match fault {
                Ok(fault) => error!(
                    "Fatal display fault on connector {}: {}",
                    fault.connector_id, fault.error
                ),
                Err(_) => error!("Player fault channel closed unexpectedly"),
            }
            ExitCode::FAILURE
        },
    };

    // Teardown order matters: stop producing timelines first, then stop the
    // players consuming them.
    drop(main_loop);
    runner.lock().unwrap().shutdown();
    info!("Playout server stopped");
    exit
}
