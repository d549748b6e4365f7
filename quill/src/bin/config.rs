// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::args::Args;

/// Default log_level.
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment overrides, applied after the file is parsed.
const ENV_LOG_LEVEL: &str = "RIPPLED_REPORTING_LOG_LEVEL";
const ENV_DB_URL: &str = "RIPPLED_REPORTING_DB_URL";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub create_if_missing: bool,
    pub write_buffer_size: usize,
    pub enable_debug: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./quill-data"),
            create_if_missing: true,
            write_buffer_size: 64 * 1024 * 1024,
            enable_debug: false,
        }
    }
}

impl DatabaseConfig {
    pub fn options(&self) -> node::database::DatabaseOptions {
        node::database::DatabaseOptions {
            create_if_missing: self.create_if_missing,
            blocks_cf_max_write_buffer_size: self.write_buffer_size,
            enable_debug: self.enable_debug,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Response cache lifetime, tuned to the ledger close interval.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub cache_size: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3),
            cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    log_level: Option<String>,
    log_filter: Option<String>,

    pub database: DatabaseConfig,
    pub storage: node::storage::Params,
    pub etl: node::etl::Params,
    pub cache_loader: node::storage::loader::Params,
    pub peers: Vec<node::peer::PeerConfig>,
    pub forwarding: ForwardingConfig,
    pub http: quill::http::HttpConfig,
    pub rpc: quill::rpc::Params,
    pub dos_guard: quill::rpc::dos_guard::Params,
}

impl Config {
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).with_context(
                    || format!("reading config {}", path.display()),
                )?;
                toml::from_str(&raw).with_context(|| {
                    format!("parsing config {}", path.display())
                })?
            }
            None => Config::default(),
        };

        // Environment beats the file; CLI beats both.
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            config.log_level = Some(level);
        }
        if let Ok(path) = std::env::var(ENV_DB_URL) {
            config.database.path = PathBuf::from(path);
        }
        if let Some(level) = &args.log_level {
            config.log_level = Some(level.clone());
        }

        Ok(config)
    }

    pub fn log_level(&self) -> anyhow::Result<tracing::Level> {
        let level = self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL);
        tracing::Level::from_str(level)
            .with_context(|| format!("invalid log level '{level}'"))
    }

    pub fn log_filter(&self) -> String {
        self.log_filter.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let raw = r#"
            log_level = "debug"

            [database]
            path = "/var/lib/quill"

            [storage]
            key_shift = 18
            keep_ledgers = 1000000

            [etl]
            extractor_threads = 4
            read_only = false
            lease_duration = "10s"

            [cache_loader]
            style = "sync"
            num_markers = 8

            [[peers]]
            hostname = "validator-1.example.net"
            ws_port = 6006
            http_port = 5005

            [[peers]]
            hostname = "validator-2.example.net"
            ws_port = 6006

            [forwarding]
            cache_ttl = "4s"

            [http]
            listen_address = "0.0.0.0:51233"
            allow_local_admin = false

            [rpc]
            workers = 8
            queue_capacity = 128

            [dos_guard]
            max_fetches = 2097152
            sweep_interval = "10s"
            whitelist = ["127.0.0.1"]
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.storage.key_shift, 18);
        assert_eq!(config.storage.keep_ledgers, Some(1_000_000));
        assert_eq!(config.etl.extractor_threads, 4);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].http_port, None);
        assert_eq!(
            config.forwarding.cache_ttl,
            Duration::from_secs(4)
        );
        assert_eq!(config.http.listen_address.port(), 51233);
        assert!(!config.http.allow_local_admin);
        assert_eq!(config.rpc.workers, 8);
        assert_eq!(config.dos_guard.whitelist.len(), 1);
        assert_eq!(
            config.cache_loader.style,
            node::storage::loader::Style::Sync
        );
    }

    #[test]
    fn defaults_need_no_file() {
        let config = Config::default();
        assert!(config.peers.is_empty());
        assert_eq!(config.storage.key_shift, 20);
        assert_eq!(config.log_level().unwrap(), tracing::Level::INFO);
    }
}
