//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Application name used in CLI output, data directories, and node names.
pub const APP_NAME: &str = "yakut";

/// Primary binary name.
pub const BIN_NAME: &str = "yakut";

/// Short alias binary.
pub const BIN_NAME_SHORT: &str = "y";

/// Prefix of the environment variables that override command-line options.
pub const ENV_PREFIX: &str = "YAKUT";

/// Environment variable that lists extra lookup directories.
pub const ENV_PATH: &str = "YAKUT_PATH";

/// Environment variable holding a log filter that overrides `--verbose`.
pub const ENV_LOG: &str = "YAKUT_LOG";

/// Environment variable selecting the log line format; `json` emits one
/// object per line.
pub const ENV_LOG_FORMAT: &str = "YAKUT_LOG_FORMAT";

/// Default node name prefix; the command name is appended.
pub const NODE_NAME_PREFIX: &str = "org.opencyphal.yakut";

/// Archive with the public regulated data types, used when `compile` is given no sources.
pub const DEFAULT_PUBLIC_REGULATED_DATA_TYPES_ARCHIVE_URI: &str =
    "https://github.com/OpenCyphal/public_regulated_data_types/archive/master.zip";

/// Output transfer-ID maps older than this are not reused.
pub const OUTPUT_TRANSFER_ID_MAP_MAX_AGE: Duration = Duration::from_secs(60);

/// Service response timeout used when the user does not override it.
pub const DEFAULT_SERVICE_REQUEST_TIMEOUT: f64 = 1.0;

/// Exit code of a command that ran to completion but failed to achieve its goal.
pub const EXIT_CODE_UNSUCCESSFUL: i32 = 1;

/// Exit code reported after a keyboard interrupt.
pub const EXIT_CODE_INTERRUPTED: i32 = 127;

/// Major and minor version of this build, as `"vMAJOR.MINOR"`.
pub fn version_tag() -> String {
    let mut parts = env!("CARGO_PKG_VERSION").split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("v{major}.{minor}")
}

/// Returns the per-user configuration root, following the XDG convention.
fn resolve_app_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join(APP_NAME);
        }
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".config").join(APP_NAME);
    }
    std::env::temp_dir().join(APP_NAME)
}

static APP_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Version-agnostic data directory of the tool.
pub fn app_dir() -> &'static PathBuf {
    APP_DIR.get_or_init(resolve_app_dir)
}

/// Data directory specific to the current major.minor version.
pub fn version_specific_data_dir() -> PathBuf {
    app_dir().join(version_tag())
}

/// Directory holding the persisted output transfer-ID maps, one file per local node-ID.
pub fn output_transfer_id_map_dir() -> PathBuf {
    version_specific_data_dir().join("output-transfer-id-maps")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tag_has_two_components() {
        let tag = version_tag();
        assert!(tag.starts_with('v'));
        assert_eq!(tag.matches('.').count(), 1);
    }

    #[test]
    fn transfer_id_maps_live_under_versioned_dir() {
        let dir = output_transfer_id_map_dir();
        assert!(dir.ends_with("output-transfer-id-maps"));
        assert!(dir.starts_with(app_dir()));
    }
}
