pub mod config;
pub mod defaults;
pub mod namespace;
pub mod settings;

pub use config::{
    DEFAULT_CONFIG_FILENAME, ENV_CONFIG_KEY, load_toml_settings, resolve_config_source,
    validate_settings,
};
pub use defaults::*;
pub use namespace::validate_namespace;
pub use settings::GroupqSettings;
