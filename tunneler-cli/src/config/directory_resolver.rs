use std::path::{Path, PathBuf};

use directories::BaseDirs;

const SYSTEM_CONFIG_DIR: &str = "/etc/tunnelerc";
const USER_CONFIG_DIR: &str = ".tunnelerc";
const FILE_NAME: &str = "config.yaml";

/// Where the configuration file may live, most specific last.
///
/// An explicit path replaces the whole search.
pub fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_owned()];
    }

    let mut candidates = vec![Path::new(SYSTEM_CONFIG_DIR).join(FILE_NAME)];
    if let Some(dirs) = BaseDirs::new() {
        candidates.push(dirs.home_dir().join(USER_CONFIG_DIR).join(FILE_NAME));
    }
    candidates.push(PathBuf::from(FILE_NAME));

    candidates
}

/// First candidate that exists on disk.
pub fn resolve_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    config_candidates(explicit)
        .into_iter()
        .find(|path| path.is_file())
}
