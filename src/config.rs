//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_LOCATION: &str = "upload-dir";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 128 * 1024;
pub const FLASH_COOKIE_NAME: &str = "FILEDROP_FLASH";
pub const FLASH_TTL_SECS: i64 = 60;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Settings owned by the storage service.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Root directory for uploaded files, relative or absolute.
    pub location: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            location: DEFAULT_STORAGE_LOCATION.to_string(),
        }
    }
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filedrop", version = VERSION_INFO, about = "File upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "FILEDROP_STORAGE_LOCATION",
        default_value = DEFAULT_STORAGE_LOCATION,
        help = "Directory uploaded files are stored in"
    )]
    pub storage_location: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEDROP_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "FILEDROP_MAX_UPLOAD_SIZE",
        default_value_t = DEFAULT_MAX_UPLOAD_SIZE,
        help = "Max upload request size in bytes"
    )]
    pub max_upload_size: usize,
    #[arg(
        long,
        env = "FILEDROP_RESET_STORAGE",
        default_value_t = false,
        help = "Delete every stored file before starting"
    )]
    pub reset_storage: bool,
    #[arg(long, env = "FILEDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
}

impl Args {
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            location: self.storage_location.clone(),
        }
    }
}
