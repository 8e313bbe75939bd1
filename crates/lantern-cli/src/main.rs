use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use lantern_bridge::{spawn_reload_signal, Bridge, BridgeConfig, BridgeError, RunReport, ScriptScanner};
use tracing::{error, info, warn};

mod host;
mod logging;

use host::{ConsoleHost, ServerEvent};

#[derive(Parser)]
#[command(version, about = "Run a tree of Lua scripts against a console host", long_about = None)]
pub struct Cli {
    /// Enables debug logging (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Config file to use instead of the default location
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Script directory, overriding `script_path` from the config
    #[arg(short, long)]
    scripts: Option<String>,

    /// Also write logs to the data directory
    #[arg(long)]
    log_file: bool,

    /// Load the scripts, raise startup and shutdown, then exit
    #[arg(long)]
    once: bool,
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lantern").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => match default_config_path().filter(|path| path.exists()) {
            Some(path) => BridgeConfig::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => {
                info!("No config found, using defaults");
                BridgeConfig::default()
            }
        },
    };

    if let Some(scripts) = &cli.scripts {
        config.script_path = scripts.clone();
    }
    Ok(config)
}

fn log_report(report: &RunReport) {
    if !report.errors.is_empty() {
        warn!(
            "{} scripts failed to load ({} name conflicts)",
            report.errors.len(),
            report.conflicts().count()
        );
    }
}

/// Lua errors are not `Send`, so bridge errors reach anyhow as their message
fn bridge_error(err: BridgeError) -> anyhow::Error {
    anyhow::anyhow!("{err}")
}

fn elapsed_ms(since: Instant) -> u32 {
    u32::try_from(since.elapsed().as_millis()).unwrap_or(u32::MAX)
}

async fn run(bridge: &mut Bridge, root: &Path, once: bool) -> Result<()> {
    let report = bridge
        .run_scripts()
        .map_err(bridge_error)
        .context("Failed to run scripts")?;
    log_report(&report);
    bridge.dispatch_with(None, ServerEvent::Startup, (i32::from(ServerEvent::Startup),));

    if once {
        bridge.dispatch_with(None, ServerEvent::Shutdown, (i32::from(ServerEvent::Shutdown),));
        return Ok(());
    }

    let config = bridge.config().clone();
    let mut scanner = config
        .hot_reload
        .then(|| ScriptScanner::new(root.to_path_buf(), config.hot_reload_interval()));
    if let Some(scanner) = &scanner {
        info!("Watching {} scripts for changes", scanner.tracked());
    }

    let _signal = spawn_reload_signal(bridge.reload_handle());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(config.tick_interval());
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let diff = last_tick.elapsed();
                last_tick = Instant::now();

                bridge.update(diff);
                bridge.dispatch_with(
                    None,
                    ServerEvent::WorldTick,
                    (i32::from(ServerEvent::WorldTick), u32::try_from(diff.as_millis()).unwrap_or(u32::MAX)),
                );

                if let Some(scanner) = scanner.as_mut() {
                    if scanner.should_scan() && scanner.scan_changes().has_changes() {
                        info!("Script changes detected, requesting reload");
                        bridge.request_reload();
                    }
                }

                match bridge.process_pending_reload() {
                    Some(Ok(report)) => log_report(&report),
                    Some(Err(e)) => error!("Reload failed: {}", e),
                    None => {}
                }
            }
            result = &mut shutdown => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Shutting down");
                break;
            }
        }
    }

    bridge.dispatch_with(None, ServerEvent::Shutdown, (i32::from(ServerEvent::Shutdown),));
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(cli.log_file, cli.debug).context("Failed to initialize logging")?;

    let config = load_config(&cli)?;
    let root = config.script_root();
    info!("Starting lantern with scripts from {}", root.display());

    let started = Instant::now();
    let mut bridge = Bridge::new(config, Rc::new(ConsoleHost::new("lantern")));
    bridge
        .initialize()
        .map_err(bridge_error)
        .context("Failed to initialize the bridge")?;
    info!("Bridge ready in {} ms", elapsed_ms(started));

    let result = run(&mut bridge, &root, cli.once).await;
    bridge.uninitialize();
    result
}
