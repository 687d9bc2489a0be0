use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Subcommand;
use colored::Colorize;
use log::{error, info, warn};

use crate::config::ConfigManager;
use crate::control_state::ControlState;
use crate::host::{DeviceClass, Host, InputBackend};
use crate::input::{monitor_devices, EvdevBackend};
use crate::mapping::{ActivationStatus, MappingEngine};
use crate::sim::{ReplayScript, SimulatedHost};

#[derive(Subcommand, Clone)]
pub enum AuxDriverTask {
    /// List connected game controllers.
    EnumDevices,
    /// Print raw samples of matching game controllers.
    MonitorDevice { name_regex: Option<String> },
    ValidateConfig,
    /// Run the configuration against a scripted session.
    Replay { script: PathBuf },
}

fn sanitize_cfg_file_path(cfg_file_path: &Path) -> Result<()> {
    if !cfg_file_path.exists() {
        let e = format!(
            "Configuration file is not found at {}, current dir is {}.\n\
            Please specify proper location of the configuration file via -c command line option.\n\
            ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~",
            cfg_file_path.to_str().unwrap_or("Empty file path..."),
            std::env::current_dir()?
                .to_str()
                .unwrap_or("Unknown current working dir...")
        );
        log::error!("{e}");

        if cfg_file_path.is_relative() {
            let nb = "NB: You have specified relative config file path. \n\
             NB: for the config to be found specify full config path like -c <full path to your config>\n\
             ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~".to_string();
            log::warn!("{nb}");
        }
        bail!("Config file not found.");
    }
    Ok(())
}

fn report_config_issues(config_manager: &ConfigManager) -> Result<usize> {
    let issues = config_manager.validate()?;
    for issue in &issues {
        warn!("> {issue}");
    }
    Ok(issues.len())
}

pub async fn run_aux_task(aux_task: &AuxDriverTask, cfg_file_path: &Path, debug: bool) -> Result<()> {
    match aux_task {
        AuxDriverTask::EnumDevices => {
            info!("Available game controllers:");
            for (i, device) in EvdevBackend::new(debug)
                .enumerate_devices(DeviceClass::GameControl)?
                .iter()
                .enumerate()
            {
                info!("> {}. {} @ {}", i + 1, device.name, device.id);
            }
        }
        AuxDriverTask::MonitorDevice { name_regex } => {
            monitor_devices(
                &regex::Regex::new(name_regex.as_deref().unwrap_or(".*"))?,
                debug,
            )
            .await?;
        }
        AuxDriverTask::ValidateConfig => {
            sanitize_cfg_file_path(cfg_file_path)?;
            let mut config_manager = ConfigManager::new(cfg_file_path, debug)?;
            config_manager.load()?;
            let errors = config_manager.validate()?;
            if errors.is_empty() {
                config_manager.log_summary();
                info!("Configuration is valid.");
            } else {
                error!("Configuration errors:");
                for error in errors {
                    error!("> {}", error);
                }
                bail!("Configuration validation failed");
            }
        }
        AuxDriverTask::Replay { script } => {
            sanitize_cfg_file_path(cfg_file_path)?;
            let mut config_manager = ConfigManager::new(cfg_file_path, debug)?;
            config_manager.load()?;
            report_config_issues(&config_manager)?;
            let frames = ReplayScript::load(script)?.run(&config_manager, debug)?;
            let commands: usize = frames.iter().map(|frame| frame.commands.len()).sum();
            info!(
                "{}",
                format!(
                    "Replayed {} tick(s), {} host command(s) issued.",
                    frames.len(),
                    commands
                )
                .green()
                .bold()
            );
        }
    }
    Ok(())
}

fn watch_config_file(cfg_file_path: &Path) -> Result<tokio::sync::mpsc::Receiver<()>> {
    use notify_debouncer_full::{new_debouncer, DebounceEventResult};

    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let mut debouncer = new_debouncer(
        std::time::Duration::from_millis(500),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    if event.kind.is_modify() || event.kind.is_create() {
                        let _ = tx.blocking_send(());
                        break;
                    }
                }
            }
            Err(e) => error!("Config file watch error: {:?}", e),
        },
    )?;

    debouncer.watch(
        cfg_file_path,
        notify_debouncer_full::notify::RecursiveMode::NonRecursive,
    )?;

    // The watcher lives for the whole process.
    std::mem::forget(debouncer);

    Ok(rx)
}

pub async fn run_mapping_engine(
    cfg_file_path: &Path,
    no_hot_reload: bool,
    debug: bool,
    tick_rate_hz: Option<u32>,
) -> Result<()> {
    sanitize_cfg_file_path(cfg_file_path)?;

    let mut config_watcher = if !no_hot_reload {
        Some(watch_config_file(cfg_file_path)?)
    } else {
        None
    };

    let mut config_manager = ConfigManager::new(cfg_file_path, debug)?;
    let mut backend = EvdevBackend::new(debug);
    let mut engine = MappingEngine::new(debug);

    'engine_restart: loop {
        if debug {
            log::debug!("Loading configuration.");
        }
        config_manager.load()?;
        config_manager.log_summary();
        if let Some(created) = config_manager.get_config().created_date {
            info!("Configuration created on {}", created.format("%Y-%m-%d %H:%M"));
        }
        report_config_issues(&config_manager)?;

        let mut host = SimulatedHost::new(config_manager.stabilization_threshold());
        match engine.activate(&config_manager, &mut backend, &mut host)? {
            ActivationStatus::Active { devices } if devices == 0 => {
                warn!("----");
                warn!("No configured game controller is connected - nothing to do, spinning in vain.");
                warn!("Please fix the configuration file and we'll catch up with hot-reload.");
                warn!("----");
            }
            ActivationStatus::Active { devices } => info!("Bound devices: {devices}"),
            ActivationStatus::VersionMismatch { found, expected } => {
                warn!("Configuration v{found} is ignored, this build reads v{expected}.");
            }
            ActivationStatus::Inactive => {}
        }

        let rate = tick_rate_hz.unwrap_or(config_manager.tick_rate()).max(1);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs_f64(1.0 / f64::from(rate)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Starting mapping engine at {rate} Hz.");
        if !no_hot_reload {
            info!(
                "{} {}.",
                "Hot-reload on configuration file change is active"
                    .magenta()
                    .bold(),
                "(disable with --no-hot-reload)"
            );
        }
        info!("{}", "Press Ctrl+C to stop.".green().bold());
        info!("{}", "=".repeat(50));

        let mut last_state = ControlState::default();
        'current_run: loop {
            #[rustfmt::skip]
            tokio::select! {
                _ = interval.tick() => {
                    if host.is_time_accelerated() {
                        engine.on_accelerated_tick(&mut backend, &mut host);
                        continue 'current_run;
                    }
                    // The standalone host has no input of its own.
                    let mut state = ControlState::default();
                    engine.on_tick(&mut backend, &mut host, &mut state);
                    if debug && state != last_state {
                        log::debug!("[{}] {state}", engine.current_mode());
                    }
                    last_state = state;
                }
                _ = async {
                    match config_watcher.as_mut() {
                        Some(rx) => { let _ = rx.recv().await; }
                        None => std::future::pending().await,
                    };
                } => {
                    let config_check_result = ConfigManager::new(cfg_file_path, debug)
                        .and_then(|mut candidate| candidate.load());

                    if let Err(e) = config_check_result {
                        log::error!("\n---\n!!! Configuration load failed while trying to hot-reload.");
                        log::error!("!!! Will continue running with previous config.\n---\n");
                        log::error!("The error was: \n {e:?} \n");
                        log::warn!("Running with previous (valid) configuration.");
                        continue 'current_run;
                    }

                    info!("Configuration validated. Stopping mapping engine to restart with new configuration.");
                    engine.shutdown(&mut backend);
                    info!("Restarting mapping engine with new configuration.");
                    continue 'engine_restart;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, going to terminate. Stopping mapping engine.");
                    engine.shutdown(&mut backend);
                    info!("Cleanup complete, terminating immediately.");
                    return Ok(())
                }
            }
        }
    }
}

pub fn check_linux_system_requirements() -> Result<()> {
    if !std::path::Path::new("/dev/input").exists() {
        error!("/dev/input not found. No game controller can be read.");
    }

    if !nix::unistd::Uid::current().is_root() {
        let groups = nix::unistd::getgroups()?;
        let input_gid = nix::unistd::Group::from_name("input")?.map(|g| g.gid);

        if let Some(gid) = input_gid {
            if !groups.contains(&gid) {
                warn!("Warning: Current user not in 'input' group");
                warn!("Run: sudo usermod -a -G input $USER");
                warn!("Then logout and login again");
            }
        }
    }

    Ok(())
}
