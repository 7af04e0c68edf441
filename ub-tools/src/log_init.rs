//! Process-wide logging setup for the daemon binary, grounded on the
//! `syslog`+`log` pairing (`src/bin` entrypoints init a syslog
//! logger in production and fall back to stderr in dev/test runs).

use log::LevelFilter;

/// Initializes the global logger. `to_stderr` mirrors the
/// `to_stdout` flag on `WorkerTask::new` for interactive/test runs;
/// otherwise messages go to syslog under the `urbackup-server` facility
/// tag.
pub fn init_logging(to_stderr: bool, level: LevelFilter) {
    if to_stderr {
        let _ = env_logger::Builder::new().filter_level(level).try_init();
        return;
    }

    match syslog::unix(syslog::Facility::LOG_DAEMON) {
        Ok(writer) => {
            let logger = syslog::BasicLogger::new(writer);
            let _ = log::set_boxed_logger(Box::new(logger));
            log::set_max_level(level);
        }
        Err(_) => {
            let _ = env_logger::Builder::new().filter_level(level).try_init();
        }
    }
}
