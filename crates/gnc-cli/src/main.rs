//! `gnc-console` – operator console for the GNC telemetry bridge.
//!
//! 1. Checks for `~/.gnc-console/config.toml`; runs a **First-Run Wizard**
//!    when the file is absent.
//! 2. Mounts the dashboard view: subscribes to control-mode and attitude
//!    telemetry, connects to the rosbridge endpoint and starts the reconnect
//!    health check.
//! 3. Drops the operator into an **interactive REPL** (`/status`, `/mode`,
//!    `/toggle`, `/view`, `/settings`, `/help`).
//! 4. Intercepts **Ctrl-C** to unmount the view and close the bridge cleanly.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use gnc_bridge::BridgeSession;
use gnc_dashboard::{DashboardStore, MountConfig, ViewMount};

fn main() {
    // Held for the whole process; flushes exported spans on drop.
    let _telemetry = gnc_dashboard::init_tracing("gnc-console");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – unmounting …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(
            error = %e,
            "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available"
        );
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gnc-bridge")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    // ── Mount the dashboard view ──────────────────────────────────────────
    let view = cfg.view();
    let mount_config = MountConfig {
        health_interval: cfg.health_interval(),
        ..MountConfig::default()
    };
    let mut mount = {
        let _entered = runtime.enter();
        match ViewMount::mount(
            BridgeSession::new(cfg.bridge_url.clone()),
            DashboardStore::default(),
            view,
            &mount_config,
        ) {
            Ok(mount) => mount,
            Err(e) => {
                println!("{}: {}", "Cannot mount dashboard".red(), e);
                println!("  Fix the bridge URL with {} or GNC_BRIDGE_URL.", "/settings".bold());
                std::process::exit(1);
            }
        }
    };

    println!(
        "\n  {} on {} (health check every {} ms)",
        view.title().bold(),
        cfg.bridge_url.yellow(),
        mount_config.health_interval.as_millis()
    );
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&runtime, &mount, shutdown);

    {
        let _entered = runtime.enter();
        mount.unmount();
    }
    println!("{}", "  ✓ Dashboard unmounted; bridge closed.".green());
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     GNC Console First-Run Wizard     ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's point the console at a bridge.\n");

    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);

    cfg.bridge_url = prompt_line(
        &format!("  rosbridge WebSocket URL [{}]: ", cfg.bridge_url),
        &cfg.bridge_url,
    );

    println!("  Which view should open on start-up?");
    println!("    1) Earth orbit    (default)");
    println!("    2) Space station");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    cfg.default_view = match choice.trim() {
        "2" => "station".to_string(),
        _ => "earth".to_string(),
    };

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ________  ________"#.bold().cyan());
    println!("{}", r#"  / ____/ | / / ____/"#.bold().cyan());
    println!("{}", r#" / / __/  |/ / /     "#.bold().cyan());
    println!("{}", r#"/ /_/ / /|  / /___   "#.bold().cyan());
    println!("{}", r#"\____/_/ |_/\____/   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "GNC Console".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Guidance, Navigation & Control telemetry bridge");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
