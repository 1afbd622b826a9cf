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

// Subordinate id ranges, one `name:start:count` entry per line, where name
// is either a user name or a numeric uid.

use std::{fs::read_to_string, path::Path};

use anyhow::{bail, Context, Result};
use log::debug;
use nix::unistd::{Uid, User};

use crate::starter::IdMapping;
use crate::utils::StageErr;

pub const SUBUID_FILE: &str = "/etc/subuid";
pub const SUBGID_FILE: &str = "/etc/subgid";

/// Smallest range giving a container a full set of 16 bit ids.
pub const MIN_RANGE_COUNT: u32 = 65536;

/// Find the subordinate range allotted to `uid` in `path` and map it right
/// after container id 0.
pub fn get_id_range(path: &Path, uid: Uid) -> Result<IdMapping> {
    let content = read_to_string(path)
        .with_context(|| StageErr::OpenFile(path.to_string_lossy().to_string()))?;
    let user = User::from_uid(uid)
        .with_context(|| format!("Failed to look up user {}", uid))?
        .map(|u| u.name);
    let uid_str = uid.to_string();
    let display = user.clone().unwrap_or_else(|| uid_str.clone());

    for (nr, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 3 {
            debug!("Skipping malformed line {} of {}", nr + 1, path.display());
            continue;
        }
        if fields[0] != uid_str && Some(fields[0]) != user.as_deref() {
            continue;
        }

        let start: u32 = fields[1]
            .parse()
            .with_context(|| format!("bad range start at line {} of {}", nr + 1, path.display()))?;
        let count: u32 = fields[2]
            .parse()
            .with_context(|| format!("bad range count at line {} of {}", nr + 1, path.display()))?;
        if count < MIN_RANGE_COUNT {
            bail!(
                "mapping entry for {} in {} has a range count less than {}",
                display,
                path.display(),
                MIN_RANGE_COUNT
            );
        }
        return Ok(IdMapping::new(1, start, count));
    }

    bail!("no mapping entry found in {} for {}", path.display(), display);
}
