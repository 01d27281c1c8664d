pub mod normalize;
pub mod replay;
pub mod stream;

use ecg_stream::SessionConfig;

/// Session settings from `--config`, or defaults when none is given.
pub fn load_config(path: Option<&str>) -> Result<SessionConfig, String> {
    match path {
        Some(path) => SessionConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(SessionConfig::default()),
    }
}
