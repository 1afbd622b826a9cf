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

use std::{convert::Infallible, os::unix::io::RawFd};

use anyhow::{anyhow, bail, Context, Result};
use caps::CapSet;
use log::{debug, error};
use nix::{
    sys::signal::Signal,
    unistd::{getgid, getppid, getuid, setgroups, setresgid, setresuid, Gid, Pid, Uid},
};

use super::{CapabilitySets, StarterConfig};
use crate::{
    engine::Engine,
    utils::{
        channel::{COMPLETE, FAILURE},
        logger::FATAL_EXIT_CODE,
        prctl, Connection, Namespaces, StageErr,
    },
};

/// Wait for the starter to write the id mappings of the user namespace.
fn wait_id_mappings(setup_socket: RawFd) -> Result<()> {
    let setup = Connection::wrap(setup_socket, "setup-socket")?;
    match setup.wait()? {
        Some(COMPLETE) => Ok(()),
        Some(_) => bail!("starter failed to write id mappings"),
        None => bail!("starter exited before writing id mappings"),
    }
}

/// The parent death signal is lost if the starter died before it was set.
/// Across a PID namespace the parent always reads as 0.
fn check_starter(starter: Pid, config: &StarterConfig) -> Result<()> {
    let expected = if config.namespaces.contains(Namespaces::PID) {
        Pid::from_raw(0)
    } else {
        starter
    };
    if getppid() != expected {
        bail!("starter {} exited before the container process started", starter);
    }
    Ok(())
}

fn set_id(gid: Gid, uid: Uid) -> Result<()> {
    prctl::set_keep_capabilities(true)
        .map_err(|e| anyhow!("Failed to enable keeping capabilities: {}", e))?;
    setresgid(gid, gid, gid).with_context(|| "Failed to setresgid")?;
    setresuid(uid, uid, uid).with_context(|| "Failed to setresuid")?;

    let permitted = caps::read(None, CapSet::Permitted)
        .with_context(|| StageErr::GetAllCaps("Permitted".to_string()))?;
    caps::set(None, CapSet::Effective, &permitted)
        .with_context(|| StageErr::SetCaps("Effective".to_string()))?;
    prctl::set_keep_capabilities(false)
        .map_err(|e| anyhow!("Failed to disable keeping capabilities: {}", e))?;
    Ok(())
}

fn switch_ids(config: &StarterConfig) -> Result<()> {
    if config.target_uid.is_none() && config.target_gids.is_empty() {
        return Ok(());
    }

    if !config.no_setgroups {
        setgroups(&config.target_gids).with_context(|| "Failed to set supplementary groups")?;
    }
    let gid = config.target_gids.first().copied().unwrap_or_else(getgid);
    let uid = config.target_uid.unwrap_or_else(getuid);
    debug!("Switching to uid {} gid {}", uid, gid);
    set_id(gid, uid)
}

fn apply_capabilities(sets: &CapabilitySets) -> Result<()> {
    if let Some(bounding) = &sets.bounding {
        let all_caps = caps::read(None, CapSet::Bounding)
            .with_context(|| StageErr::GetAllCaps("Bounding".to_string()))?;
        for cap in all_caps.difference(bounding) {
            caps::drop(None, CapSet::Bounding, *cap)
                .with_context(|| format!("Failed to drop {} from bounding set", cap))?;
        }
    }
    if let Some(effective) = &sets.effective {
        caps::set(None, CapSet::Effective, effective)
            .with_context(|| StageErr::SetCaps("Effective".to_string()))?;
    }
    if let Some(permitted) = &sets.permitted {
        caps::set(None, CapSet::Permitted, permitted)
            .with_context(|| StageErr::SetCaps("Permitted".to_string()))?;
    }
    if let Some(inheritable) = &sets.inheritable {
        caps::set(None, CapSet::Inheritable, inheritable)
            .with_context(|| StageErr::SetCaps("Inheritable".to_string()))?;
    }
    if let Some(ambient) = &sets.ambient {
        caps::set(None, CapSet::Ambient, ambient)
            .with_context(|| StageErr::SetCaps("Ambient".to_string()))?;
    }
    Ok(())
}

fn start(
    starter: Pid,
    setup_socket: Option<RawFd>,
    master: &Connection,
    config: &StarterConfig,
    engine: &Engine,
) -> Result<Infallible> {
    if let Some(fd) = setup_socket {
        wait_id_mappings(fd)?;
    }
    // The master is the parent thread, its exit takes the container down.
    prctl::set_parent_death_signal(Signal::SIGKILL)
        .map_err(|e| anyhow!("Failed to set parent death signal: {}", e))?;
    check_starter(starter, config)?;

    switch_ids(config)?;
    apply_capabilities(&config.capabilities)?;

    if engine.ops.pre_start().is_some() {
        master.signal(COMPLETE)?;
        match master.wait()? {
            Some(COMPLETE) => debug!("Released by the pre start process"),
            Some(_) => bail!("pre start process failed"),
            None => bail!("master exited during pre start process"),
        }
    }

    debug!("Starting {} engine process", engine.ops.name());
    engine.ops.start_process(master)
}

/// Container process entry, runs right after the clone. Only returns when
/// the payload could not be executed, with the process exit code.
///
/// The master socket is closed by the exec, any failure before is written
/// as `'f'` so the master never waits on a process which gave up.
pub fn container_stage(
    starter: Pid,
    setup_socket: Option<RawFd>,
    master_socket: RawFd,
    config: &StarterConfig,
    engine: &Engine,
) -> i32 {
    let master = match Connection::wrap(master_socket, "master-socket") {
        Ok(c) => c,
        Err(e) => {
            error!("{:#}", e);
            return FATAL_EXIT_CODE;
        }
    };

    let err = match start(starter, setup_socket, &master, config, engine) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    error!("{:#}", err);
    if let Err(e) = master.signal(FAILURE) {
        error!("{:#}", e);
    }
    FATAL_EXIT_CODE
}
