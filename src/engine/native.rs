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
    convert::Infallible,
    fs::remove_dir_all,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
    sync::mpsc::Receiver,
};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use nix::{
    sys::signal::Signal,
    unistd::{getgid, getuid, Pid},
};
use serde::Deserialize;

use super::{execute, monitor_process, CommonConfig, ExitStatus, HostHelpers, Operations};
use crate::{
    starter::{IdMapping, StarterConfig},
    utils::{Connection, Namespaces},
};

pub const NAME: &str = "native";

const FUSERMOUNT: [&str; 2] = ["fusermount3", "fusermount"];

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeConfig {
    pub envs: Vec<String>,
    /// Namespaces created for the container, by name.
    pub namespaces: Vec<String>,
    /// The image is mounted with FUSE in the host mount namespace.
    pub image_fuse: bool,
    pub fuse_mount: Option<PathBuf>,
    /// Temporary directory holding the image, removed with the FUSE mount.
    pub delete_temp_dir: Option<PathBuf>,
}

/// Run a command in a set of new namespaces, with the current user's ids.
pub struct NativeEngine {
    args: Vec<String>,
    config: NativeConfig,
}

impl NativeEngine {
    pub fn new(common: &CommonConfig) -> Result<Self> {
        let config = if common.engine_config.is_null() {
            NativeConfig::default()
        } else {
            serde_json::from_value(common.engine_config.clone())
                .with_context(|| "bad native engine configuration provided")?
        };
        Ok(Self {
            args: common.args.clone(),
            config,
        })
    }

    pub fn boxed(common: &CommonConfig) -> Result<Box<dyn Operations>> {
        Ok(Box::new(Self::new(common)?))
    }

    fn clean_fuse_temp_dir(&self) -> Result<()> {
        if let Some(mount) = &self.config.fuse_mount {
            debug!("Lazy Unmounting image with FUSE...");
            unmount_fuse_lazy(mount)
                .with_context(|| format!("while unmounting fuse directory: {}", mount.display()))?;
        }
        if let Some(temp_dir) = &self.config.delete_temp_dir {
            info!("Removing image tempDir {}", temp_dir.display());
            remove_dir_all(temp_dir).with_context(|| {
                format!(
                    "failed to delete container image tempDir {}",
                    temp_dir.display()
                )
            })?;
        }
        Ok(())
    }
}

fn unmount_fuse_lazy(mount: &Path) -> Result<()> {
    for bin in FUSERMOUNT {
        let status = match Command::new(bin).args(["-u", "-z"]).arg(mount).status() {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to run {}", bin)),
        };
        if !status.success() {
            bail!("{} -u -z {} exited with {}", bin, mount.display(), status);
        }
        return Ok(());
    }
    bail!("none of {} found in PATH", FUSERMOUNT.join(", "));
}

impl Operations for NativeEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn prepare_config(&mut self, config: &mut StarterConfig) -> Result<()> {
        let mut namespaces = Namespaces::empty();
        for name in &self.config.namespaces {
            namespaces |= Namespaces::from_name(name)?;
        }
        config.namespaces = namespaces;

        if config.user_namespace() {
            let uid = getuid();
            let gid = getgid();
            config.add_uid_mappings(&[IdMapping::new(uid.as_raw(), uid.as_raw(), 1)]);
            config.add_gid_mappings(&[IdMapping::new(gid.as_raw(), gid.as_raw(), 1)]);
            // An unprivileged process may only write its gid map once
            // setgroups is denied.
            config.allow_setgroups = config.is_suid;
            config.no_setgroups = true;
            config.target_uid = Some(uid);
            config.target_gids = vec![gid];
        }
        Ok(())
    }

    fn create_container(&self, pid: Pid, _rpc: &Connection) -> Result<()> {
        debug!("Container process {} needs no privileged setup", pid);
        Ok(())
    }

    fn start_process(&self, _master: &Connection) -> Result<Infallible> {
        execute(&self.args, &self.config.envs)
    }

    fn post_start_host(&self) -> Result<()> {
        if self.config.image_fuse && self.config.delete_temp_dir.is_some() {
            return self.clean_fuse_temp_dir();
        }
        Ok(())
    }

    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<ExitStatus> {
        monitor_process(pid, signals)
    }

    fn cleanup_host(&self) -> Result<()> {
        if !self.config.image_fuse {
            return Ok(());
        }
        match &self.config.delete_temp_dir {
            // Already removed after the container started.
            Some(dir) if dir.is_dir() => self.clean_fuse_temp_dir(),
            _ => Ok(()),
        }
    }

    fn host_helpers(&self) -> HostHelpers {
        HostHelpers {
            post_start: self.config.image_fuse,
            cleanup: self.config.image_fuse,
        }
    }
}
