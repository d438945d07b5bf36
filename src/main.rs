use std::{path::PathBuf, process::ExitCode, time::Duration};

use ccs_datalogger::{
    config::{transport::TransportConfig, Config},
    core::{
        health::HealthReport,
        plugins::registry::builtin_names,
        service::LoggerService,
        transport,
    },
    logger::LoggerManager,
    print_error, print_info,
};
use clap::Parser;
use tracing::{debug, error, info};

/// Longest accepted `--period`, one week.
const MAX_PERIOD_MINUTES: u64 = 7 * 24 * 60;

/// Plugin-driven weather sensor logger
#[derive(Parser, Debug)]
#[command(name = "ccs-datalogger", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file; created with defaults if missing
    #[arg(
        default_value = "/etc/ccs-datalogger/config.toml",
        env = "CCS_DATALOGGER_CONFIG"
    )]
    config: PathBuf,

    /// Default sampling period in minutes (overrides the config file)
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=MAX_PERIOD_MINUTES))]
    period: Option<u64>,

    /// Readings per CSV file before a new file is started (overrides the
    /// config file)
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    events: Option<u32>,
}

/// Poll interval for a `--period` given in minutes, `None` on overflow.
fn period_from_minutes(minutes: u64) -> Option<Duration> {
    minutes.checked_mul(60).map(Duration::from_secs)
}

fn log_plugins_table(report: &HealthReport, available: Vec<&'static str>) {
    let name_width = report
        .plugins
        .iter()
        .map(|p| p.health.name.len())
        .chain(available.iter().map(|s| s.len()))
        .max()
        .unwrap_or(10)
        .max("Plugin".len());

    let header = format!("{:<width$} | Status", "Plugin", width = name_width);
    let sep = format!("{}-+-{}", "-".repeat(name_width), "-".repeat(12));

    info!("{}", header);
    info!("{}", sep);

    for plugin in &report.plugins {
        let status = plugin.health.status.as_str().to_uppercase();
        match &plugin.health.last_error {
            Some(reason) => info!(
                "{:<width$} | {} ({})",
                plugin.health.name,
                status,
                reason,
                width = name_width
            ),
            None => info!("{:<width$} | {}", plugin.health.name, status, width = name_width),
        }
    }
    for name in available {
        info!("{:<width$} | BUILTIN", name, width = name_width);
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown..."),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, initiating graceful shutdown...");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match Config::load_or_create(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            print_error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(minutes) = cli.period {
        let Some(period) = period_from_minutes(minutes) else {
            print_error!("Sampling period of {} min is too long", minutes);
            return ExitCode::FAILURE;
        };
        print_info!("Sampling period overridden: {} min", minutes);
        cfg.plugins.poll_interval_default = period;
    }
    if let Some(events) = cli.events {
        match &mut cfg.transport {
            TransportConfig::Csv(csv) => csv.rollover_count = events,
            TransportConfig::Stdout => print_info!("--events ignored by the stdout transport"),
        }
    }

    let logger_manager = match LoggerManager::new(cfg.logger.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            print_error!("Failed to setup Log Manager: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger_manager.init() {
        print_error!("Failed to init Log Manager: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Starting ccs-datalogger version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.transport);

    let transport = transport::build(&cfg.transport);
    let mut service = match LoggerService::start(&cfg, transport).await {
        Ok(service) => service,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log_plugins_table(&service.health(), builtin_names());

    shutdown_signal().await;

    let report = service.stop().await;
    if !report.drained {
        error!(
            undelivered = report.undelivered,
            "Shutdown grace period expired, undelivered readings were dead-lettered"
        );
    }
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_parsed_in_minutes() {
        let cli = Cli::try_parse_from(["ccs-datalogger", "-p", "30", "-e", "12"]).unwrap();
        assert_eq!(cli.period, Some(30));
        assert_eq!(cli.events, Some(12));
        assert_eq!(period_from_minutes(30), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn out_of_range_period_is_rejected() {
        assert!(Cli::try_parse_from(["ccs-datalogger", "--period", "0"]).is_err());
        assert!(Cli::try_parse_from(["ccs-datalogger", "--period", "18446744073709551615"]).is_err());
        assert_eq!(period_from_minutes(u64::MAX), None);
    }
}
