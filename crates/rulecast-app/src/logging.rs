//! Logging setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::LogArgs;

/// Resolves the level from the flags; `--debug` beats `--verbose`.
pub fn level(args: &LogArgs) -> &str {
    if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    }
}

/// Default filter directive for a level.
pub fn default_directive(level: &str) -> String {
    format!("rulecast={},warn", level)
}

/// Initialize logging. Console output goes to stderr so `render` can write
/// configs to stdout; with `--log-dir` a daily-rotated file is added.
pub fn init_logging(args: &LogArgs) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level(args))));

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("rulecast")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_precedence() {
        let mut args = LogArgs {
            log_level: "warn".into(),
            ..Default::default()
        };
        assert_eq!(level(&args), "warn");
        args.verbose = true;
        assert_eq!(level(&args), "debug");
        args.debug = true;
        assert_eq!(level(&args), "trace");
    }

    #[test]
    fn default_directive_scopes_to_crate() {
        assert_eq!(default_directive("info"), "rulecast=info,warn");
    }
}
