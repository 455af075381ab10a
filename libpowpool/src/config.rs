// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, fs, path::PathBuf, time};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home_dir) = env::var("HOME") {
        let mut config_path = PathBuf::from(home_dir);
        config_path.push(".config");
        config_path.push("powpool");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Override the path prefix under which the per-session shared
    /// memory buffers are created. The server key and a -signal or
    /// -control suffix get appended to form the full path.
    pub shmem_prefix: Option<String>,

    /// Override the path prefix under which the per-session status
    /// fifos are created. The server key and a -in or -out suffix
    /// get appended to form the full path.
    pub fifo_prefix: Option<String>,

    /// How long a client will poll for the shared memory regions
    /// to show up before giving up on the server. Fractional
    /// seconds allowed. By default, 1.0.
    pub attach_timeout_seconds: Option<f64>,

    /// If set, ask the session manager to snapshot the controls a
    /// session touches and restore them when the session ends. The
    /// snapshotting itself is the session manager's job; the batch
    /// layer only forwards the request.
    pub enable_session_save_restore: Option<bool>,
}

impl Config {
    pub fn shmem_prefix(&self) -> &str {
        self.shmem_prefix.as_deref().unwrap_or(consts::SHMEM_PREFIX)
    }

    pub fn fifo_prefix(&self) -> &str {
        self.fifo_prefix.as_deref().unwrap_or(consts::FIFO_PREFIX)
    }

    pub fn attach_timeout(&self) -> time::Duration {
        match self.attach_timeout_seconds {
            Some(seconds) if seconds > 0.0 => time::Duration::from_secs_f64(seconds),
            _ => consts::ATTACH_TIMEOUT,
        }
    }

    pub fn session_save_restore(&self) -> bool {
        self.enable_session_save_restore.unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_defaults() {
        let config: Config = toml::from_str("").expect("empty config parses");
        assert_eq!(config.shmem_prefix(), consts::SHMEM_PREFIX);
        assert_eq!(config.fifo_prefix(), consts::FIFO_PREFIX);
        assert_eq!(config.attach_timeout(), consts::ATTACH_TIMEOUT);
        assert!(!config.session_save_restore());
    }

    #[test]
    fn parse_overrides() {
        let config: Config = toml::from_str(
            r#"
            shmem_prefix = "/tmp/pp-test/batch-buffer-"
            fifo_prefix = "/tmp/pp-test/batch-status-"
            attach_timeout_seconds = 2.5
            enable_session_save_restore = true
            "#,
        )
        .expect("config parses");
        assert_eq!(config.shmem_prefix(), "/tmp/pp-test/batch-buffer-");
        assert_eq!(config.fifo_prefix(), "/tmp/pp-test/batch-status-");
        assert_eq!(config.attach_timeout(), time::Duration::from_millis(2500));
        assert!(config.session_save_restore());
    }

    #[test]
    fn nonpositive_timeout_falls_back() {
        let config: Config =
            toml::from_str("attach_timeout_seconds = 0.0").expect("config parses");
        assert_eq!(config.attach_timeout(), consts::ATTACH_TIMEOUT);
    }
}
