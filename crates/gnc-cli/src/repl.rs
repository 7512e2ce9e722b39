//! REPL – the operator's interactive shell.
//!
//! Supported slash-commands:
//!   /help                         – show this list
//!   /status                       – attitude, mode and bridge state
//!   /mode <cmg|torque|thruster>   – request a control mode
//!   /toggle                       – request the next mode in the cycle
//!   /view <earth|station>         – switch the 3D scene
//!   /settings                     – edit `~/.gnc-console/config.toml`
//!   /quit | /exit                 – unmount and exit

use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use gnc_dashboard::{
    ActiveView, ButtonStyle, DashboardState, Indicator, ModeOutcome, SubsystemHealth, ViewMount,
};
use gnc_types::{ControlMode, GncError};
use tokio::runtime::Runtime;

use crate::config::{self, Config};

/// How long the shell waits for a `/gnc/set_mode` reply before giving up.
const MODE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Mode(ControlMode),
    Toggle,
    View(ActiveView),
    Settings,
    Quit,
}

/// Parse one input line.  The error is the message shown to the operator.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or_default();
    let arg = words.next();
    match (name, arg) {
        ("/help", _) => Ok(Command::Help),
        ("/status", _) => Ok(Command::Status),
        ("/toggle", _) => Ok(Command::Toggle),
        ("/settings", _) => Ok(Command::Settings),
        ("/quit" | "/exit", _) => Ok(Command::Quit),
        ("/mode", Some(raw)) => match ControlMode::from_wire(raw) {
            ControlMode::Other(_) => {
                Err(format!("unknown mode '{raw}' (cmg, torque, thruster)"))
            }
            mode => Ok(Command::Mode(mode)),
        },
        ("/mode", None) => Err("usage: /mode <cmg|torque|thruster>".to_string()),
        ("/view", Some(raw)) => ActiveView::parse(raw)
            .map(Command::View)
            .ok_or_else(|| format!("unknown view '{raw}' (earth, station)")),
        ("/view", None) => Err("usage: /view <earth|station>".to_string()),
        (other, _) => Err(format!("unknown command '{other}'")),
    }
}

/// Entry point for the interactive REPL.
///
/// Returns when the operator quits, on EOF, on Ctrl-C at the prompt, or when
/// `shutdown` is raised by the signal handler.
pub fn run(runtime: &Runtime, mount: &ViewMount, shutdown: Arc<AtomicBool>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let prompt = format!("{} ", prompt_prefix(&mount.store().snapshot()));
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "Ctrl-C – unmounting.".yellow());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse_command(line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Status) => cmd_status(mount),
            Ok(Command::Mode(mode)) => cmd_mode(runtime, mount, Some(mode)),
            Ok(Command::Toggle) => cmd_mode(runtime, mount, None),
            Ok(Command::View(view)) => {
                mount.set_view(view);
                println!("{} {}", "✓ Showing".green(), view.title().bold());
            }
            Ok(Command::Settings) => cmd_settings(&mut editor),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(message) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                message,
                "/help".bold()
            ),
        }
    }
}

fn prompt_prefix(state: &DashboardState) -> String {
    let light = match state.indicator() {
        Indicator::Green => "●".green(),
        Indicator::Red => "●".red(),
    };
    format!("{} {}", light, "gnc>".bold().cyan())
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "GNC Console Commands".bold().underline());
    let rows = [
        ("/status", "attitude, mode and bridge state"),
        ("/mode <cmg|torque|thruster>", "request a control mode"),
        ("/toggle", "request the next mode"),
        ("/view <earth|station>", "switch the 3D scene"),
        ("/settings", "edit ~/.gnc-console/config.toml"),
        ("/quit  /exit", "unmount and exit"),
    ];
    for (command, about) in rows {
        println!("  {} – {}", format!("{command:<29}").bold().cyan(), about);
    }
    println!();
}

fn cmd_status(mount: &ViewMount) {
    let state = mount.store().snapshot();

    println!("{}", state.view.title().bold().underline());
    let bridge = match state.indicator() {
        Indicator::Green => "Connected".green(),
        Indicator::Red => "Disconnected".red(),
    };
    println!("  Bridge      : {} ({})", bridge, mount.session().endpoint().dimmed());
    if let Some(reason) = &state.last_error {
        println!("  Last error  : {}", reason.yellow());
    }

    let mode = state.mode_label();
    let mode = match state.toggle_style() {
        ButtonStyle::Orange => mode.truecolor(249, 115, 22),
        ButtonStyle::Red => mode.red(),
        ButtonStyle::Blue => mode.blue(),
    };
    let switching = if state.transitioning { " (switching)" } else { "" };
    println!("  Mode        : {}{}", mode.bold(), switching.dimmed());

    println!("  Attitude    : {}", state.attitude);
    if let Some(q) = state.orientation {
        let (roll, pitch, yaw) = q.euler_degrees();
        println!(
            "  Orientation : roll {:>7.2}°  pitch {:>7.2}°  yaw {:>7.2}°",
            roll, pitch, yaw
        );
    }
    for (subsystem, health) in state.subsystems() {
        let health = match health {
            SubsystemHealth::Nominal => health.to_string().green(),
            SubsystemHealth::Degraded => health.to_string().yellow(),
        };
        println!("  {:<17}: {}", subsystem.label(), health);
    }
    match state.last_telemetry {
        Some(at) => println!("  Telemetry   : {}", at.format("%H:%M:%S%.3f UTC")),
        None => println!("  Telemetry   : {}", "none received".dimmed()),
    }
}

/// Request `mode`, or the next mode in the cycle when `None`.
fn cmd_mode(runtime: &Runtime, mount: &ViewMount, mode: Option<ControlMode>) {
    let controller = mount.mode_controller().clone();
    let result = runtime.block_on(async move {
        let request = async {
            match mode {
                Some(mode) => controller.request_mode(mode).await,
                None => controller.toggle().await,
            }
        };
        tokio::time::timeout(MODE_REQUEST_TIMEOUT, request).await
    });

    match result {
        Ok(Ok(ModeOutcome::Applied(mode))) => {
            println!("{} {}", "✓ Mode set to".green(), mode.label().bold())
        }
        Ok(Ok(ModeOutcome::Rejected(mode))) => {
            println!("{} {}", "✗ Bridge rejected".red(), mode.label().bold())
        }
        Ok(Ok(ModeOutcome::Busy)) => {
            println!("{}", "A mode change is already in progress.".yellow())
        }
        Ok(Err(GncError::NotConnected)) => {
            println!("{}", "Not connected to the bridge; try again shortly.".yellow())
        }
        Ok(Err(e)) => println!("{}: {}", "Mode change failed".red(), e),
        Err(_) => println!(
            "{} no reply within {}s",
            "Mode change timed out:".red(),
            MODE_REQUEST_TIMEOUT.as_secs()
        ),
    }
}

fn cmd_settings(editor: &mut DefaultEditor) {
    let mut cfg = match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {}", "Error loading config".red(), e);
            return;
        }
    };

    println!("{}", "Settings Editor".bold().underline());
    println!("  (edit a value and press Enter; changes apply on next start)");

    cfg.bridge_url = prompt_str(editor, "  Bridge URL           : ", &cfg.bridge_url);

    let raw = prompt_str(
        editor,
        "  Health interval (ms) : ",
        &cfg.health_interval_ms.to_string(),
    );
    match raw.parse::<u64>() {
        Ok(ms) => cfg.health_interval_ms = ms,
        Err(_) => println!(
            "  {} '{}' is not a number, keeping {}",
            "Warning:".yellow(),
            raw,
            cfg.health_interval_ms
        ),
    }

    let raw = prompt_str(editor, "  Default view         : ", &cfg.default_view);
    match ActiveView::parse(&raw) {
        Some(view) => cfg.default_view = view.as_str().to_string(),
        None => println!(
            "  {} '{}' is not a view (earth, station), keeping {}",
            "Warning:".yellow(),
            raw,
            cfg.default_view
        ),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "{} {}",
            "✓ Settings saved to".green(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

/// Prompt with `current` pre-filled.  Returns `current` on any input error.
fn prompt_str(editor: &mut DefaultEditor, msg: &str, current: &str) -> String {
    match editor.readline_with_initial(msg, (current, "")) {
        Ok(line) if !line.trim().is_empty() => line.trim().to_string(),
        _ => current.to_string(),
    }
}
