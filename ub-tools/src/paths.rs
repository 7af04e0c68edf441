//! On-disk layout constants, grounded on `pbs-buildcfg`'s
//! path-macro style.

/// Default state directory holding the SQLite databases and hash-data
/// files.
pub const URBACKUP_STATE_DIR: &str = "/var/lib/urbackup";

/// Directory under which one subdirectory per client/timestamp is
/// created.
pub const DEFAULT_BACKUP_FOLDER: &str = "/var/backups/urbackup";

pub fn main_db_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("backup_server.db")
}

pub fn files_db_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("backup_server_files.db")
}

pub fn links_db_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("backup_server_links.db")
}

pub fn link_journal_db_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("backup_server_link_journal.db")
}

pub fn settings_db_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("backup_server_settings.db")
}

pub fn server_idents_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("server_idents.txt")
}

pub fn session_idents_path(state_dir: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join("session_idents.txt")
}

pub fn hdat_img_path(state_dir: &str, volume: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join(format!("hdat_img_{volume}.dat"))
}

pub fn hdat_file_path(state_dir: &str, volume: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join(format!("hdat_file_{volume}.dat"))
}

pub fn hdat_other_path(state_dir: &str, volume: &str) -> std::path::PathBuf {
    std::path::Path::new(state_dir).join(format!("hdat_other_{volume}.cbt"))
}
