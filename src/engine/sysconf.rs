// Copyright (c) 2024 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::{
    fs::{metadata, read_to_string},
    io::ErrorKind,
    os::unix::fs::MetadataExt,
    path::Path,
};

use anyhow::{bail, Context, Result};
use log::{debug, warn};

use crate::utils::StageErr;

pub const SYSCONF_FILE: &str = "/etc/ozstage/ozstage.conf";

/// Runtime wide settings, `key = value` per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysConfig {
    pub allow_setuid: bool,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self { allow_setuid: true }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => bail!("invalid value {} for {}, expected yes or no", value, key),
    }
}

impl SysConfig {
    /// A missing file yields the defaults.
    pub fn parse(path: &Path) -> Result<Self> {
        let mut config = SysConfig::default();
        let content = match read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not found, using defaults", path.display());
                return Ok(config);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| StageErr::OpenFile(path.to_string_lossy().to_string()))
            }
        };

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => bail!("invalid line in {}: {}", path.display(), line),
            };
            match key {
                "allow setuid" => config.allow_setuid = parse_bool(key, value)?,
                _ => warn!("Unknown directive {} in {}", key, path.display()),
            }
        }
        Ok(config)
    }
}

/// Check that `path` exists and belongs to `uid`.
pub fn is_owner(path: &Path, uid: u32) -> bool {
    match metadata(path) {
        Ok(m) => m.uid() == uid,
        Err(_) => false,
    }
}
