//! Process-wide structured logging: mozlog JSON to stdout in production, human-readable terminal
//! output otherwise. Grounded on `syncserver::logging` (the flat-file version of that module;
//! the pack's `syncserver/src/logging/` directory belongs to a later, `tracing`-based revision
//! that doesn't match this pack's `syncserver/Cargo.toml`, which still lists the `slog` stack
//! used here).
use std::io;

use slog::{slog_o, Drain};
use slog_mozlog_json::MozLogJson;

/// Initialize the global `slog` logger. `json` selects mozlog-JSON (stdout, for production)
/// versus a human-readable terminal format (for local development, `human_logs = true`).
pub fn init_logging(json: bool) -> Result<(), String> {
    let logger = if json {
        let hostname = hostname::get()
            .map_err(|e| e.to_string())?
            .into_string()
            .map_err(|_| "non-utf8 hostname".to_owned())?;

        let drain = MozLogJson::new(io::stdout())
            .logger_name(format!("{}-{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
            .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
            .hostname(hostname)
            .build()
            .fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    };

    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
    Ok(())
}

pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, slog_o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}
