use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Load a service configuration.
///
/// Sources, lowest precedence first: an optional `configuration` file in the
/// working directory (any format the `config` crate understands), then
/// environment variables `<PREFIX>__SECTION__KEY`. A `.env` file is read
/// first when present.
pub fn load<T: DeserializeOwned>(env_prefix: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name("configuration").required(false))
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default = "default_port")]
        port: u16,
    }

    fn default_port() -> u16 {
        8080
    }

    #[test]
    fn falls_back_to_defaults_without_sources() {
        let sample: Sample = load("SERVICE_CORE_CONFIG_SAMPLE").unwrap();
        assert_eq!(sample.port, 8080);
    }
}
