pub mod settings;

pub use settings::Config;

use crate::error::ClientError;
use std::sync::Arc;

/// Loads and returns the application configuration as an `Arc<Config>`.
/// Reads a `.env` file when present, then the process environment.
pub fn load_config() -> Result<Arc<settings::Config>, ClientError> {
    dotenv::dotenv().ok();

    let config = settings::Config::from_env();
    config.validate()?;
    config.log_settings();

    Ok(Arc::new(config))
}
