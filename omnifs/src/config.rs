//! Container and server settings, loaded from a JSON document.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FsError;
use crate::sb::{ContainerHeader, RESERVED_GAP};
use crate::users::{validate_username, USER_RECORD_SIZE};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub filesystem: FilesystemConfig,
    pub security: SecurityConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub total_size: u64,
    /// Bytes reserved for the header. The user table starts right after.
    pub header_size: u64,
    pub block_size: u32,
    pub max_users: u32,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            total_size: 2 * 1024 * 1024,
            header_size: 4096,
            block_size: 4096,
            max_users: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub admin_username: String,
    pub admin_password: String,
    pub require_auth: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            admin_username: "admin".to_string(),
            admin_password: "password123".to_string(),
            require_auth: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Inactivity timeout applied to every accepted connection.
    pub read_timeout_secs: u64,
    /// Longest request line accepted. Must leave room for a full payload.
    pub max_request_bytes: usize,
    /// Largest file payload a single request may carry.
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            workers: 4,
            queue_capacity: 64,
            read_timeout_secs: 10,
            max_request_bytes: 2 * 1024 * 1024,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FsError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            FsError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        let config: Config = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| FsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, FsError> {
        let config: Config =
            serde_json::from_str(text).map_err(|e| FsError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FsError> {
        let fs = &self.filesystem;
        let sec = &self.security;
        let invalid = |msg: &str| Err(FsError::InvalidConfig(msg.to_string()));

        if fs.block_size == 0 {
            return invalid("block_size must be positive");
        }
        if fs.max_users == 0 {
            return invalid("max_users must be positive");
        }
        if fs.header_size < ContainerHeader::ENCODED_LEN as u64 || fs.header_size > u32::MAX as u64
        {
            return invalid("header_size cannot hold the container header");
        }
        let data_offset =
            fs.header_size + fs.max_users as u64 * USER_RECORD_SIZE as u64 + RESERVED_GAP;
        if fs.total_size < data_offset + fs.block_size as u64 {
            return invalid("total_size leaves no room for data blocks");
        }
        if sec.admin_username.is_empty()
            || sec.admin_username.len() >= ContainerHeader::MAX_CREDENTIAL_LEN
        {
            return invalid("admin_username must be 1 to 31 bytes");
        }
        if validate_username(&sec.admin_username).is_err() {
            return invalid("admin_username is not a valid username");
        }
        if sec.admin_password.is_empty()
            || sec.admin_password.len() > ContainerHeader::MAX_CREDENTIAL_LEN
        {
            return invalid("admin_password must be 1 to 32 bytes");
        }
        if self.server.workers == 0 || self.server.queue_capacity == 0 {
            return invalid("server needs at least one worker and one queue slot");
        }
        if self.server.max_request_bytes <= self.server.max_payload_bytes {
            return invalid("max_request_bytes must exceed max_payload_bytes");
        }
        Ok(())
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.filesystem.total_size = total_size;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.filesystem.block_size = block_size;
        self
    }

    pub fn with_max_users(mut self, max_users: u32) -> Self {
        self.filesystem.max_users = max_users;
        self
    }

    pub fn with_admin(mut self, username: &str, password: &str) -> Self {
        self.security.admin_username = username.to_string();
        self.security.admin_password = password.to_string();
        self
    }
}
