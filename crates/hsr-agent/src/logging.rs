use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "hsr-agent.log";

/// Default filter: `level` for the agent's own crates, warnings elsewhere.
pub fn default_directives(level: &str) -> String {
    format!("warn,hsr_agent={level},hsr_core={level},hsr_crypto={level}")
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// With `log_dir`, output goes to a daily rotating file through a background
/// writer; keep the returned guard alive for the life of the process or
/// buffered lines are lost.
pub fn init_logging(
    level: &str,
    json: bool,
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))?;

    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_dir.is_none());

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))?;

    Ok(guard)
}
