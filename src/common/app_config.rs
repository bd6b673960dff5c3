// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<FlintrocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_env_or_default() -> Result<&'static FlintrocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env() {
        Some(path) => FlintrocksConfig::load_from_file(&path)?,
        None => FlintrocksConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static FlintrocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("FLINTROCKS_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    let default = PathBuf::from("flintrocks.toml");
    if default.is_file() { Some(default) } else { None }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlintrocksConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub join: JoinConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker (driver) count for sink and source pipelines. Zero means
    /// use the host's available parallelism.
    #[serde(default)]
    pub worker_count: usize,
    /// Upper bound of the buffer pool the engine may address.
    #[serde(default = "default_buffer_pool_max_bytes")]
    pub buffer_pool_max_bytes: u64,
    /// Chunks of probe input one source thread is expected to own.
    #[serde(default = "default_parallel_scan_chunk_count")]
    pub parallel_scan_chunk_count: usize,
}

fn default_buffer_pool_max_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_parallel_scan_chunk_count() -> usize {
    120
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            buffer_pool_max_bytes: default_buffer_pool_max_bytes(),
            parallel_scan_chunk_count: default_parallel_scan_chunk_count(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    /// Force the out-of-core join path regardless of memory pressure.
    #[serde(default)]
    pub force_external: bool,
    /// Force parallel pointer-table construction and single-chunk scan
    /// granularity so concurrency bugs reproduce on small inputs.
    #[serde(default)]
    pub verify_parallelism: bool,
}

impl FlintrocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: FlintrocksConfig = toml::from_str(&text)
            .map_err(|e| anyhow!("parse config file {}: {e}", path.display()))?;
        Ok(cfg)
    }
}
