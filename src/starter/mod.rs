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

pub mod host;
pub mod launcher;
pub mod master;
pub mod stage;

pub use launcher::launch;
pub use master::{ImageFd, ImageFile};

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use caps::CapsHashSet;
use log::debug;
use nix::unistd::{geteuid, getuid, Gid, Uid};

use crate::utils::Namespaces;

/// Directories searched for the setuid id mapping helpers.
pub const ID_MAP_SEARCH_PATH: [&str; 5] =
    ["/usr/bin", "/bin", "/usr/sbin", "/sbin", "/usr/local/bin"];

/// One line of /proc/<pid>/uid_map or gid_map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

/// Capability sets applied to the container process, `None` leaves a set
/// untouched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapabilitySets {
    pub bounding: Option<CapsHashSet>,
    pub effective: Option<CapsHashSet>,
    pub permitted: Option<CapsHashSet>,
    pub inheritable: Option<CapsHashSet>,
    pub ambient: Option<CapsHashSet>,
}

/// How the starter builds the container process. Engines fill it in
/// `Operations::prepare_config`, nothing touches it afterwards.
#[derive(Debug, Default, Clone)]
pub struct StarterConfig {
    /// Real user is unprivileged but the starter runs with euid 0.
    pub is_suid: bool,
    pub namespaces: Namespaces,
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    pub newuidmap_path: Option<PathBuf>,
    pub newgidmap_path: Option<PathBuf>,
    /// Keep setgroups(2) usable inside the user namespace.
    pub allow_setgroups: bool,
    /// Don't set supplementary groups when switching to the target ids.
    pub no_setgroups: bool,
    pub target_uid: Option<Uid>,
    pub target_gids: Vec<Gid>,
    pub capabilities: CapabilitySets,
}

impl StarterConfig {
    pub fn new() -> Self {
        Self {
            is_suid: geteuid().is_root() && !getuid().is_root(),
            ..Default::default()
        }
    }

    pub fn add_uid_mappings(&mut self, mappings: &[IdMapping]) {
        self.uid_mappings.extend_from_slice(mappings);
    }

    pub fn add_gid_mappings(&mut self, mappings: &[IdMapping]) {
        self.gid_mappings.extend_from_slice(mappings);
    }

    pub fn set_newuidmap_path(&mut self) -> Result<()> {
        self.newuidmap_path = Some(find_id_map_binary("newuidmap", &ID_MAP_SEARCH_PATH)?);
        Ok(())
    }

    pub fn set_newgidmap_path(&mut self) -> Result<()> {
        self.newgidmap_path = Some(find_id_map_binary("newgidmap", &ID_MAP_SEARCH_PATH)?);
        Ok(())
    }

    pub fn user_namespace(&self) -> bool {
        self.namespaces.contains(Namespaces::USER)
    }
}

fn find_id_map_binary(name: &str, dirs: &[&str]) -> Result<PathBuf> {
    for dir in dirs {
        let path = Path::new(dir).join(name);
        if path.is_file() {
            debug!("Found {} at {}", name, path.display());
            return Ok(path);
        }
    }
    bail!("{} was not found in {}", name, dirs.join(":"));
}
