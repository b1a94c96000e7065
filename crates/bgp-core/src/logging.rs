use tracing_subscriber::EnvFilter;

/// Where the speaker's structured logs should go once tracing is initialized.
///
/// Mirrors the split between "attached to a terminal" and "running as a
/// daemon" that a long-lived routing process needs: stdout during
/// development, a rolling file or syslog once detached.
#[derive(Debug, Clone)]
pub enum LoggingOutput {
    Stdout,
    File { directory: String, file_name_prefix: String },
    Syslog { ident: String },
}

/// Installs the global tracing subscriber. Call once at startup; the
/// returned guard must be held for the process lifetime when `output` is
/// `File`, otherwise buffered lines are lost on exit.
pub fn setup_tracing(output: LoggingOutput) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match output {
        LoggingOutput::Stdout => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
        LoggingOutput::File { directory, file_name_prefix } => {
            let appender = tracing_appender::rolling::daily(directory, file_name_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .json()
                .init();
            Some(guard)
        }
        LoggingOutput::Syslog { ident } => {
            // Best effort: fall back to stdout if the local syslog socket is unreachable,
            // since a routing process must still log somewhere if syslogd is down.
            match syslog::unix(syslog::Facility::LOG_DAEMON) {
                Ok(writer) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(move || writer.clone())
                        .with_ansi(false)
                        .init();
                }
                Err(_) => {
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                }
            }
            let _ = ident;
            None
        }
    }
}
