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
    path::{Path, PathBuf},
    sync::mpsc::Receiver,
};

use anyhow::{anyhow, bail, Context, Result};
use libseccomp::{
    ScmpAction, ScmpArch, ScmpArgCompare, ScmpCompareOp, ScmpFilterContext, ScmpSyscall,
};
use log::{debug, info, warn};
use nix::{
    mount::{mount, MsFlags},
    sys::signal::Signal,
    unistd::{getgid, getuid, Gid, Pid, Uid},
};
use procfs::process::Process;
use serde::Deserialize;

use super::{
    execute, monitor_process,
    subid::{get_id_range, SUBGID_FILE, SUBUID_FILE},
    sysconf::{is_owner, SysConfig, SYSCONF_FILE},
    CommonConfig, ExitStatus, Operations,
};
use crate::{
    starter::{CapabilitySets, IdMapping, StarterConfig},
    utils::{Connection, Namespaces, StageErr},
};

pub const NAME: &str = "fakeroot";

const SELINUX_MOUNT: &str = "/sys/fs/selinux";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FakerootConfig {
    pub envs: Vec<String>,
    /// Bound on top of /root in the build environment.
    pub home: Option<PathBuf>,
    pub build_env: bool,
    #[serde(rename = "noPIDNS")]
    pub no_pid_ns: bool,
    pub no_setgroups: bool,
    pub conf_path: PathBuf,
    pub subuid_path: PathBuf,
    pub subgid_path: PathBuf,
}

impl Default for FakerootConfig {
    fn default() -> Self {
        Self {
            envs: Vec::new(),
            home: None,
            build_env: false,
            no_pid_ns: false,
            no_setgroups: false,
            conf_path: PathBuf::from(SYSCONF_FILE),
            subuid_path: PathBuf::from(SUBUID_FILE),
            subgid_path: PathBuf::from(SUBGID_FILE),
        }
    }
}

/// Run a command as root inside a user namespace backed by the caller's
/// subordinate id ranges.
pub struct FakerootEngine {
    args: Vec<String>,
    config: FakerootConfig,
}

impl FakerootEngine {
    pub fn new(common: &CommonConfig) -> Result<Self> {
        let config = if common.engine_config.is_null() {
            FakerootConfig::default()
        } else {
            serde_json::from_value(common.engine_config.clone())
                .with_context(|| "bad fakeroot engine configuration provided")?
        };
        Ok(Self {
            args: common.args.clone(),
            config,
        })
    }

    pub fn boxed(common: &CommonConfig) -> Result<Box<dyn Operations>> {
        Ok(Box::new(Self::new(common)?))
    }

    fn check_sysconf(&self, config: &mut StarterConfig) -> Result<()> {
        let conf_path = &self.config.conf_path;
        if config.is_suid && !is_owner(conf_path, 0) {
            bail!("{} must be owned by root", conf_path.display());
        }

        let sysconf = SysConfig::parse(conf_path)
            .with_context(|| format!("unable to parse {} file", conf_path.display()))?;
        if config.is_suid {
            if !sysconf.allow_setuid {
                bail!(
                    "fakeroot requires to set 'allow setuid = yes' in {}",
                    conf_path.display()
                );
            }
        } else {
            info!("Fakeroot requested with unprivileged workflow, fallback to newuidmap/newgidmap");
            debug!("Search for newuidmap binary");
            config.set_newuidmap_path()?;
            debug!("Search for newgidmap binary");
            config.set_newgidmap_path()?;
        }
        Ok(())
    }
}

fn id_mappings(own_id: u32, subid_file: &Path, uid: Uid) -> Result<[IdMapping; 2]> {
    let range =
        get_id_range(subid_file, uid).map_err(|e| anyhow!("could not use fakeroot: {:#}", e))?;
    Ok([IdMapping::new(0, own_id, 1), range])
}

/// Turn mknod(2) and mknodat(2) into no-ops for block devices, and for
/// character devices other than 0:0 (whiteouts), so package managers can
/// run without CAP_MKNOD in the initial namespace.
fn seccomp_profile() -> Result<ScmpFilterContext> {
    let mut filter = ScmpFilterContext::new_filter(ScmpAction::Allow)?;
    #[cfg(target_arch = "x86_64")]
    filter
        .add_arch(ScmpArch::X8664)
        .with_context(|| StageErr::AddScmpArch)?;
    #[cfg(target_arch = "aarch64")]
    filter
        .add_arch(ScmpArch::Aarch64)
        .with_context(|| StageErr::AddScmpArch)?;

    let block = libc::S_IFBLK as u64;
    let chr = libc::S_IFCHR as u64;
    // Index of the mode argument, the device number follows it.
    for (name, mode) in [("mknod", 1u32), ("mknodat", 2u32)] {
        let sc = ScmpSyscall::from_name(name)?;
        filter
            .add_rule_conditional(
                ScmpAction::Errno(0),
                sc,
                &[ScmpArgCompare::new(mode, ScmpCompareOp::MaskedEqual(block), block)],
            )
            .with_context(|| format!("Failed to add {} rule for block devices", name))?;
        filter
            .add_rule_conditional(
                ScmpAction::Errno(0),
                sc,
                &[
                    ScmpArgCompare::new(mode, ScmpCompareOp::MaskedEqual(chr), chr),
                    ScmpArgCompare::new(mode + 1, ScmpCompareOp::NotEqual, 0),
                ],
            )
            .with_context(|| format!("Failed to add {} rule for character devices", name))?;
    }
    Ok(filter)
}

fn remount_selinux_readonly() -> Result<()> {
    let process = Process::myself().with_context(|| "Failed to access /proc/self")?;
    let mount_info = process
        .mountinfo()
        .with_context(|| "while parsing /proc/self/mountinfo")?;
    if !mount_info
        .into_iter()
        .any(|m| m.mount_point == Path::new(SELINUX_MOUNT))
    {
        return Ok(());
    }

    // Makes SELinux look disabled in the chroot. Kernels 5.9+ refuse the
    // remount but don't need it.
    let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    if let Err(e) = mount(None::<&str>, SELINUX_MOUNT, None::<&str>, flags, None::<&str>) {
        debug!("while remount {} read-only: {}", SELINUX_MOUNT, e);
        debug!("note {} remount failure is expected on kernel 5.9+", SELINUX_MOUNT);
    }
    Ok(())
}

impl Operations for FakerootEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn prepare_config(&mut self, config: &mut StarterConfig) -> Result<()> {
        self.check_sysconf(config)?;

        let mut namespaces = Namespaces::USER | Namespaces::MOUNT;
        if !self.config.no_pid_ns {
            namespaces |= Namespaces::PID;
        }
        config.namespaces = namespaces;

        let uid = getuid();
        let uid_mappings = id_mappings(uid.as_raw(), &self.config.subuid_path, uid)?;
        config.add_uid_mappings(&uid_mappings);
        let gid_mappings = id_mappings(getgid().as_raw(), &self.config.subgid_path, uid)?;
        config.add_gid_mappings(&gid_mappings);

        config.allow_setgroups = true;
        config.no_setgroups = self.config.no_setgroups;
        config.target_uid = Some(Uid::from_raw(0));
        config.target_gids = vec![Gid::from_raw(0)];

        let all = caps::all();
        config.capabilities = CapabilitySets {
            bounding: Some(all.clone()),
            effective: Some(all.clone()),
            permitted: Some(all.clone()),
            inheritable: Some(all.clone()),
            ambient: Some(all),
        };
        Ok(())
    }

    fn create_container(&self, _pid: Pid, _rpc: &Connection) -> Result<()> {
        Ok(())
    }

    fn start_process(&self, _master: &Connection) -> Result<Infallible> {
        if self.args.is_empty() {
            bail!("no command to execute provided");
        }
        if !self.config.build_env {
            return execute(&self.args, &self.config.envs);
        }

        let home = self.config.home.as_ref().ok_or_else(|| {
            anyhow!("a user home directory is required to bind it on top of /root directory")
        })?;
        mount(
            Some(home),
            "/root",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .with_context(|| format!("failed to mount {} to /root", home.display()))?;
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .with_context(|| "failed to mount proc filesystem")?;
        remount_selinux_readonly()?;

        if let Err(e) = seccomp_profile().and_then(|f| {
            f.load()
                .with_context(|| "Failed to load filter into the kernel")
        }) {
            warn!(
                "Could not apply seccomp filter, some bootstrap may not work correctly: {:#}",
                e
            );
        }
        execute(&self.args, &self.config.envs)
    }

    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<ExitStatus> {
        monitor_process(pid, signals)
    }
}
