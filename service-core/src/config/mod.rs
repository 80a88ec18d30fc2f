use crate::error::AppError;
use config::{Config as Cfg, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::de::DeserializeOwned;

/// Start a layered configuration: an optional `configuration` file, then
/// environment variables such as `{PREFIX}__SECTION__KEY`.
///
/// Services add their own defaults to the returned builder before calling
/// [`load`]; defaults always have the lowest precedence.
pub fn layered(env_prefix: &str) -> ConfigBuilder<DefaultState> {
    dotenvy::dotenv().ok();

    Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(Environment::with_prefix(env_prefix).separator("__"))
}

/// Build and deserialize a layered configuration.
pub fn load<T: DeserializeOwned>(builder: ConfigBuilder<DefaultState>) -> Result<T, AppError> {
    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}
