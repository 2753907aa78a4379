//! Console-driven networking demo.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run two copies with `cargo run -p nebula-demo -- --host --id HOST` and
//! `cargo run -p nebula-demo -- --join 127.0.0.1:10084 --id CLIENT1`, then type
//! `help` into either console.

mod app;
mod console;
mod frame_loop;
mod remote;
mod ships;

use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::TryRecvError;
use nebula_config::{CliArgs, Config};
use tracing::{info, warn};

use crate::app::DemoApp;
use crate::console::Command;
use crate::frame_loop::FrameLoop;

/// Sleep between frames when nothing else is going on.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// How often the connection table is printed when `show_net_status` is set.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(Config::default_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(2);
    }

    nebula_log::init_logging(&config.debug);
    info!("Config directory: {}", config_dir.display());

    let show_status = config.debug.show_net_status;
    let mut app = match DemoApp::new(config) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Failed to set up the session: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = app.start_remote() {
        warn!("Remote commands unavailable: {e}");
    }

    if args.host {
        print_lines(&app.execute(Command::Host { port: None }));
    } else if args.join.is_some() {
        print_lines(&app.execute(Command::Join { address: None }));
    }

    let mut input = match console::spawn_stdin_reader() {
        Ok(rx) => Some(rx),
        Err(e) => {
            warn!("Console input unavailable: {e}");
            None
        }
    };

    let mut frames = FrameLoop::new();
    let mut last_status = Instant::now();
    while !app.quit_requested() {
        while let Some(rx) = &input {
            match rx.try_recv() {
                Ok(line) => print_lines(&app.run_line(&line)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Keep running headless; `rc <i> quit` still stops us.
                    info!("Console input closed");
                    input = None;
                }
            }
        }

        let now = Instant::now();
        frames.tick(now, |dt| print_lines(&app.frame(now, dt)));

        if show_status && now.duration_since(last_status) >= STATUS_INTERVAL {
            print_lines(&app.status_lines());
            last_status = now;
        }
        std::thread::sleep(IDLE_SLEEP);
    }

    print_lines(&app.execute(Command::Disconnect));
    info!("Shutting down after {} frames", frames.frame_count());
}
