use std::path::{Path, PathBuf};

use crate::controller::Herald;

pub const CONFIG_ENV: &str = "HERALD_CONFIG";

const DEFAULT_PATHS: [&str; 2] = ["./herald.config.ron", "/etc/herald/herald.config.ron"];

/// Find the configuration file using the following precedence:
/// 1. `explicit`, when given on the command line
/// 2. `HERALD_CONFIG` environment variable
/// 3. ./herald.config.ron (current working directory)
/// 4. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
/// An explicit or environment path that does not exist, or no file at any of
/// the default locations.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("Configuration file does not exist: {}", path.display());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    if let Some(path) = DEFAULT_PATHS.iter().map(PathBuf::from).find(|path| path.exists()) {
        return Ok(path);
    }

    let paths_tried = DEFAULT_PATHS
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Read and parse a RON configuration file.
///
/// # Errors
/// The file cannot be read or is not a valid `Herald` document.
pub fn load(path: &Path) -> anyhow::Result<Herald> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
    })?;

    parse(&content).map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
}

/// # Errors
/// `content` is not a valid `Herald` document.
pub fn parse(content: &str) -> Result<Herald, ron::error::SpannedError> {
    ron::from_str(content)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_must_exist() {
        let err = find_config_file(Some(Path::new("/nonexistent/herald.config.ron")))
            .expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/herald.config.ron"));
    }

    #[test]
    fn explicit_path_wins() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        assert_eq!(
            find_config_file(Some(file.path())).expect("found"),
            file.path().to_path_buf()
        );
    }

    #[test]
    fn load_reports_the_path() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), "Herald(queue: Nope)").expect("write");

        let err = load(file.path()).expect_err("invalid");
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
