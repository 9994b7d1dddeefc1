//! Filesystem locations used by clirelay.

use std::path::{Path, PathBuf};

/// Name of the debug dump directory inside the data directory.
pub const DUMP_DIR_NAME: &str = "debug_dumps";

/// Get the data directory for clirelay.
///
/// - Linux: `~/.local/share/clirelay`
/// - macOS: `~/Library/Application Support/clirelay`
pub fn get_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("clirelay"))
        .unwrap_or_else(|| PathBuf::from(".clirelay"))
}

/// Default directory for request debug dumps.
pub fn get_dump_dir() -> PathBuf {
    get_data_dir().join(DUMP_DIR_NAME)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// Covers `--flag=~/path`, where the shell does not expand the tilde.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}
