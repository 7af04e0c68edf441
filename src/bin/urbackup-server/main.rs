//! Daemon entrypoint: initializes logging, opens the settings/client/
//! identity stores under the state directory, and logs startup. Platform
//! snapshot/CBT drivers (VSS/dm-era/dattobd) are out of this tree's
//! scope (`ub-snapshot::SnapshotDriver` / `ub-cbt::CbtDriver`), so the
//! connection-accepting loop that would wire a concrete driver into
//! `SnapshotManager`/`CbtEngine` per platform lives at a higher,
//! platform-specific composition point than this binary provides.

use std::path::PathBuf;

use log::LevelFilter;
use ub_config::{ClientRegistry, IdentityStore, Settings};
use ub_tools::log_init::init_logging;
use ub_tools::paths;

fn state_dir_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--state-dir" {
            if let Some(dir) = args.next() {
                return PathBuf::from(dir);
            }
        }
    }
    PathBuf::from(paths::URBACKUP_STATE_DIR)
}

fn main() {
    let to_stderr = std::env::var("URBACKUP_LOG_STDERR").is_ok();
    init_logging(to_stderr, LevelFilter::Info);

    let state_dir = state_dir_from_args();
    if let Err(err) = std::fs::create_dir_all(&state_dir) {
        log::error!("failed to create state directory {state_dir:?}: {err}");
        std::process::exit(1);
    }
    let state_dir_str = state_dir.to_string_lossy();

    let settings = match Settings::open(&paths::settings_db_path(&state_dir_str)) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to open settings db: {err}");
            std::process::exit(1);
        }
    };
    let tunables = match settings.load() {
        Ok(t) => t,
        Err(err) => {
            log::error!("failed to load tunables: {err}");
            std::process::exit(1);
        }
    };

    let client_registry = match ClientRegistry::open(&state_dir.join("backup_server.db")) {
        Ok(r) => r,
        Err(err) => {
            log::error!("failed to open client registry: {err}");
            std::process::exit(1);
        }
    };

    let identity_store = match IdentityStore::open(
        &paths::server_idents_path(&state_dir_str),
        &paths::session_idents_path(&state_dir_str),
    ) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to open identity store: {err}");
            std::process::exit(1);
        }
    };

    log::info!(
        "urbackup-server starting: state_dir={state_dir:?}, client_hash_threads={}, max_sim_backups={}",
        tunables.client_hash_threads, tunables.max_sim_backups,
    );

    // Keep the stores alive for the lifetime of the process; the
    // connection-accepting loop that drives them is out of this tree's
    // scope (no concrete transport/driver wiring here, see module doc).
    let _ = (client_registry, identity_store);
}
