pub mod loader;
pub mod schema;

pub use loader::{CliOverrides, get_default_config_path, load_config};
pub use schema::{AppConfig, CleanerConfig, PersistenceConfig};
