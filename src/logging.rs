use std::io;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Where log lines go besides the daily log file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOutput {
    /// Stdout and file; for the server and one-shot commands.
    Console,
    /// File only, so interactive prompts stay readable.
    FileOnly,
}

pub fn configure_logging(output: LogOutput) {
    // File log configuration
    let file_appender = rolling::daily("logs", "annotator.log");
    let file_log = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new("info,session=debug,storage=debug,aws_config=warn"));

    // Stdout log configuration, overridable through RUST_LOG
    let stdout_log = (output == LogOutput::Console).then(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,web_request=info,storage=info,aws_config=warn,aws_smithy_runtime=warn")
        });
        fmt::layer().with_writer(io::stdout).with_filter(filter)
    });

    tracing_subscriber::Registry::default()
        .with(file_log)
        .with(stdout_log)
        .init();
}
