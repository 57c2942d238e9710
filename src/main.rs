mod config;
mod dispatch;
mod domain;
mod executor;
mod handlers;
mod heartbeat;
mod listeners;
mod logging;
mod master;
mod registry;
mod server;
mod shutdown;
mod storage;
mod store;
mod utils;
mod wire;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use config::AppConfig;
use dispatch::DispatchSettings;
use executor::WorkerDispatchExecutor;
use handlers::HandlerTable;
use heartbeat::{LivenessSweeper, SweeperConfig};
use logging::{LogLevel, Logger, LoggerConfig};
use master::{MasterContext, MasterHandler};
use registry::ConnectionRegistry;
use server::{ConnectionEvents, TcpServer};
use shutdown::ShutdownHooks;
use storage::StorageFacade;
use utils::runtime::ensure_posix_or_exit;
use utils::startup_banner::print_startup_banner;
use wire::codec::WireCodec;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let (app_config, config_source) = AppConfig::load_with_discovery(std::env::args().skip(1))
        .unwrap_or_else(|error| {
            eprintln!("configuration error: {error}");
            process::exit(2);
        });
    let logger_config = LoggerConfig::from_logging_config(&app_config.logging).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({ "source": config_source.to_string() })),
    );

    let storage = StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });

    let wire_codec = WireCodec::from_app_config(&app_config);
    logger.log(
        LogLevel::Info,
        Some("main::wire"),
        "Wire codec initialized",
        Some(json!({
            "max_envelope_size_bytes": wire_codec.max_envelope_size_bytes()
        })),
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let context = MasterContext {
        registry: Arc::clone(&registry),
        jobs: storage.jobs(),
        files: storage.files(),
        executor: Arc::new(WorkerDispatchExecutor::new(
            Arc::clone(&registry),
            wire_codec,
            Arc::clone(&logger),
        )),
        logger: Arc::clone(&logger),
    };
    let master = MasterHandler::start(
        context,
        HandlerTable::standard(),
        wire_codec,
        DispatchSettings::from_app_config(&app_config),
    )
    .unwrap_or_else(|error| {
        eprintln!("dispatcher startup error: {error}");
        process::exit(2);
    });
    let master = Arc::new(master);
    let events: Arc<dyn ConnectionEvents> = master.clone();

    let server = TcpServer::from_app_config(&app_config, Arc::clone(&logger)).unwrap_or_else(
        |error| {
            eprintln!("server startup error: {error}");
            process::exit(2);
        },
    );
    let bound_addr = server.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for worker connections",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "tls_enabled": app_config.server.tls_enabled,
            "read_timeout_ms": app_config.server.read_timeout_ms,
            "write_timeout_ms": app_config.server.write_timeout_ms,
        })),
    );

    let mut sweeper = LivenessSweeper::new(
        Arc::clone(&registry),
        Arc::clone(&logger),
        SweeperConfig::from_app_config(&app_config),
    );
    sweeper.start().unwrap_or_else(|error| {
        eprintln!("heartbeat sweeper error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Liveness sweeper started",
        Some(sweeper.metadata_payload()),
    );

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown_hooks.is_triggered() {
        match server.try_accept_persistent(&events) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(error) => logger.log(
                LogLevel::Warn,
                Some("main::server"),
                "Failed to accept connection",
                Some(json!({ "error": error.to_string() })),
            ),
        }
        thread::sleep(ACCEPT_POLL_INTERVAL);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    server.shutdown_all_connections();
    master.shutdown();
    if let Err(error) = sweeper.stop() {
        logger.warn(
            Some("main::shutdown"),
            &format!("heartbeat sweeper did not stop cleanly: {error}"),
        );
    }
    if let Err(error) = storage.flush() {
        eprintln!("storage flush error during shutdown: {error}");
        process::exit(2);
    }

    drop(server);
    logger.info(Some("main::shutdown"), "Master stopped and shutdown completed");
}
