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

// Process layout built by `launch`:
//
//      starter ----(clone)----> cleanup helper      (host namespaces)
//         |   ----(clone)----> post start helper   (host namespaces)
//         |   ----(clone)----> container process   (new namespaces)
//         v
//      master (same process as the starter)

use std::{
    convert::Infallible,
    fs::{write, OpenOptions},
    io::Write,
    os::unix::io::RawFd,
    path::Path,
    process::Command,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use nix::{
    sys::signal::{SigSet, Signal},
    unistd::{close, getpid, getppid, Pid},
};

use super::{
    host::{cleanup_host, post_start_host},
    master::{master, ImageFile, MasterSockets},
    stage::container_stage,
    IdMapping, StarterConfig,
};
use crate::{
    engine::Engine,
    utils::{
        channel::{pair, COMPLETE, FAILURE},
        clone_process, prctl, Connection, Namespaces, StageErr,
    },
};

const NO_HELPER: RawFd = -1;

fn close_fds(fds: &[RawFd]) {
    for fd in fds.iter().filter(|fd| **fd >= 0) {
        let _ = close(*fd);
    }
}

/// Clone a helper process in the host namespaces, running `run` on its end
/// of a new socket pair. Returns the master end.
///
/// `inherited` are descriptors of the master the helper must not keep.
fn spawn_host_helper<F>(
    name: &'static str,
    death_signal: Signal,
    inherited: &[RawFd],
    run: F,
) -> Result<RawFd>
where
    F: Fn(RawFd) -> Result<i32>,
{
    let (master_end, helper_end) = pair()?;
    let starter = getpid();

    clone_process(name, Namespaces::empty(), || {
        close_fds(inherited);
        close_fds(&[master_end]);
        // Kept pending until the helper waits for it, SIGKILL can't be.
        if death_signal != Signal::SIGKILL {
            let mut mask = SigSet::empty();
            mask.add(death_signal);
            mask.thread_block()
                .with_context(|| format!("Failed to block {}", death_signal))?;
        }
        prctl::set_parent_death_signal(death_signal)?;
        // The death signal is lost if the starter died before it was set.
        if getppid() != starter {
            bail!("starter exited before {} helper started", name);
        }
        run(helper_end)
    })
    .with_context(|| StageErr::CloneProcess(name))?;

    close(helper_end).with_context(|| format!("Failed to close {} helper socket", name))?;
    Ok(master_end)
}

fn format_id_mappings(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

fn write_id_mapping(mappings: &[IdMapping], pid: Pid, file: &'static str) -> Result<()> {
    let path = format!("/proc/{}/{}", pid.as_raw(), file);
    let mut opened_file = OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| StageErr::OpenFile(path))?;
    opened_file
        .write_all(format_id_mappings(mappings).as_bytes())
        .with_context(|| StageErr::WriteIdMap(file, pid.as_raw()))?;
    Ok(())
}

fn id_map_args(mappings: &[IdMapping], pid: Pid) -> Vec<String> {
    let mut args = vec![pid.as_raw().to_string()];
    for m in mappings {
        args.push(m.container_id.to_string());
        args.push(m.host_id.to_string());
        args.push(m.size.to_string());
    }
    args
}

fn run_id_map_binary(binary: &Path, mappings: &[IdMapping], pid: Pid) -> Result<()> {
    let output = Command::new(binary)
        .args(id_map_args(mappings, pid))
        .output()
        .with_context(|| format!("Failed to run {}", binary.display()))?;
    if !output.status.success() {
        bail!(
            "{} failed with {}: {}",
            binary.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn set_groups(pid: Pid, allow: bool) -> Result<()> {
    let path = format!("/proc/{}/setgroups", pid.as_raw());
    let policy = if allow { "allow" } else { "deny" };
    write(&path, policy).with_context(|| format!("Failed to write {} to {}", policy, path))
}

/// Write the user namespace mappings of `pid`, through the setuid helpers
/// when the engine asked for them.
fn set_id_mappings(pid: Pid, config: &StarterConfig) -> Result<()> {
    if config.newgidmap_path.is_none() && !config.allow_setgroups {
        set_groups(pid, false).with_context(|| "Failed to disable setting groups")?;
    }

    if !config.uid_mappings.is_empty() {
        match &config.newuidmap_path {
            Some(bin) => run_id_map_binary(bin, &config.uid_mappings, pid)?,
            None => write_id_mapping(&config.uid_mappings, pid, "uid_map")?,
        }
    }
    if !config.gid_mappings.is_empty() {
        match &config.newgidmap_path {
            Some(bin) => run_id_map_binary(bin, &config.gid_mappings, pid)?,
            None => write_id_mapping(&config.gid_mappings, pid, "gid_map")?,
        }
    }
    Ok(())
}

/// Build the container process for `engine` and turn the calling process
/// into its master. Only returns if the container process could not be set
/// up, the master itself exits.
pub fn launch(mut engine: Engine, image: Option<Box<dyn ImageFile>>) -> Result<Infallible> {
    info!(
        "Launching container {} with {} engine",
        engine.common.container_id,
        engine.ops.name()
    );
    let mut config = StarterConfig::new();
    engine
        .ops
        .prepare_config(&mut config)
        .with_context(|| format!("{} engine failed to prepare configuration", engine.ops.name()))?;
    debug!("Starter configuration: {:?}", config);

    let helpers = engine.ops.host_helpers();
    let engine = Arc::new(engine);
    let image_fd = image.as_ref().and_then(|i| i.raw_fd()).unwrap_or(NO_HELPER);

    let cleanup = if helpers.cleanup {
        let e = engine.clone();
        // SIGTERM lets the helper clean up when the master dies.
        spawn_host_helper("cleanup-host", Signal::SIGTERM, &[image_fd], move |fd| {
            Ok(cleanup_host(fd, &e))
        })?
    } else {
        NO_HELPER
    };

    let post_start = if helpers.post_start {
        let e = engine.clone();
        let inherited = [cleanup, image_fd];
        spawn_host_helper("post-start-host", Signal::SIGKILL, &inherited, move |fd| {
            post_start_host(fd, &e).map(|_| 0)
        })?
    } else {
        NO_HELPER
    };

    let (rpc, rpc_peer) = pair()?;
    let (master_socket, master_peer) = pair()?;
    let setup = if config.user_namespace() {
        Some(pair()?)
    } else {
        None
    };
    let (setup_socket, setup_peer) = match setup {
        Some((s, p)) => (s, Some(p)),
        None => (NO_HELPER, None),
    };

    let starter = getpid();
    let pid = clone_process("container", config.namespaces, || {
        // The rpc peer stays open until the payload is executed.
        close_fds(&[rpc, master_socket, setup_socket, cleanup, post_start, image_fd]);
        Ok(container_stage(starter, setup_peer, master_peer, &config, &engine))
    })
    .with_context(|| StageErr::CloneProcess("container"))?;
    info!("Container process {} created", pid);
    close_fds(&[rpc_peer, master_peer]);

    if let Some(peer) = setup_peer {
        close_fds(&[peer]);
        let setup = Connection::wrap(setup_socket, "setup-socket")?;
        if let Err(e) = set_id_mappings(pid, &config) {
            setup.signal(FAILURE)?;
            return Err(e);
        }
        setup.signal(COMPLETE)?;
    }

    let sockets = MasterSockets {
        rpc,
        master: master_socket,
        post_start,
        cleanup,
    };
    master(sockets, pid, image, engine)
}
