use crate::config::LoggingConfig;
use crate::punishment::{PunishmentEvent, Transition};
use crate::{CONSOLE_TARGET, ERROR_TARGET, LIFECYCLE_TARGET};
use std::path::Path;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Punishment log file name
pub const PUNISHMENT_LOG_FILE: &str = "punishments";

/// Initialize the logging system with console and file outputs
pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Create log directory if it doesn't exist
    if !Path::new(&config.directory).exists() {
        std::fs::create_dir_all(&config.directory)?;
    }

    let punishment_file =
        RollingFileAppender::new(Rotation::DAILY, &config.directory, PUNISHMENT_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // JSON lines for the lifecycle audit trail
    let file_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(punishment_file);

    // RUST_LOG wins over the configured level; sqlx statement logging is noisy
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?.add_directive("sqlx=warn".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!("Logging system initialized");
    Ok(())
}

/// Log a committed lifecycle event
pub fn log_transition(event: &PunishmentEvent) {
    let old_state = event
        .old_state
        .map_or_else(|| "none".to_string(), |state| state.to_string());

    let message = match event.transition {
        Transition::Created => "Punishment imposed",
        Transition::Expired => "Punishment expired",
        Transition::Revoked => "Punishment revoked",
        Transition::ReasonChanged => "Punishment reason changed",
        Transition::DurationChanged => "Punishment duration changed",
    };

    info!(
        target: LIFECYCLE_TARGET,
        punishment_id = %event.punishment_id,
        target_player = %event.target,
        kind = %event.kind,
        old_state = %old_state,
        new_state = %event.new_state,
        remote = event.remote,
        event = "transition",
        "{message}"
    );
}

/// Log a storage failure that was given up on
pub fn log_storage_failure(operation: &str, punishment_id: &str, error: &dyn std::fmt::Display) {
    error!(
        target: ERROR_TARGET,
        operation = %operation,
        punishment_id = %punishment_id,
        error = %error,
        "Storage operation failed"
    );
}

pub fn log_console(message: String) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
