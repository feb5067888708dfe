use std::process;
use std::sync::Arc;

use gearman_worker::config::AppConfig;
use gearman_worker::logging::{LogLevel, Logger, LoggerConfig};
use gearman_worker::shutdown::ShutdownHooks;
use gearman_worker::utils::runtime::{ensure_posix_or_exit, print_startup_banner};
use gearman_worker::worker::{JobContext, JobFailure, JobResult, Worker};
use serde_json::json;
use uuid::Uuid;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::try_from(&app_config.logging).unwrap_or_else(|error| {
        eprintln!("{error}");
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let mut worker = Worker::from_app_config(&app_config, Arc::clone(&logger)).unwrap_or_else(|error| {
        eprintln!("worker configuration error: {error}");
        process::exit(2);
    });
    if worker.client_id().is_none() {
        worker.set_client_id(format!("gearman-worker-{}", Uuid::new_v4()));
    }

    worker.register_task("echo", echo);
    worker.register_task("reverse", reverse);
    worker.register_task("fail", fail);

    logger.log(
        LogLevel::Info,
        Some("main::worker"),
        &format!(
            "{} v{} configured",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "servers": app_config.worker.servers,
            "client_id": worker.client_id(),
            "tasks": worker.abilities().task_names(),
            "max_payload_size_bytes": app_config.wire.max_payload_size_bytes,
        })),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let outcome = worker.work(app_config.worker.poll_timeout(), |_activity| {
        !shutdown_hooks.is_triggered()
    });
    if let Err(error) = outcome {
        eprintln!("worker stopped on error: {error}");
        process::exit(1);
    }

    logger.info(Some("main::shutdown"), "Shutdown completed");
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn echo(job: &mut JobContext<'_>) -> JobResult {
    Ok(job.data().to_vec())
}

fn reverse(job: &mut JobContext<'_>) -> JobResult {
    let mut data = job.data().to_vec();
    data.reverse();
    Ok(data)
}

fn fail(job: &mut JobContext<'_>) -> JobResult {
    Err(JobFailure::failed(format!(
        "job {} asked to fail",
        job.job().handle()
    )))
}
