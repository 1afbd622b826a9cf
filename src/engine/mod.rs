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

pub mod fakeroot;
pub mod monitor;
pub mod native;
pub mod subid;
pub mod sysconf;

pub use monitor::{monitor_process, ExitStatus, FatalSender};

use std::{convert::Infallible, ffi::CString, path::PathBuf, sync::mpsc::Receiver};

use anyhow::{anyhow, Context, Result};
use nix::{
    sys::signal::Signal,
    unistd::{execve, Pid},
};
use serde::{Deserialize, Serialize};

use crate::{starter::StarterConfig, utils::Connection};

/// Settings shared by every engine, the engine specific part stays opaque
/// until the engine constructor deserializes it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    pub engine_name: String,
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub engine_config: serde_json::Value,
}

/// Host helper processes an engine needs next to the master.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostHelpers {
    pub post_start: bool,
    pub cleanup: bool,
}

/// Engines which need to stop the container process right before it
/// executes the payload.
///
/// The master calls `pre_start_process` once the container process wrote
/// its first byte on the master socket. Errors returned here are reported
/// as fatal, `fatal` is there for work which outlives the call.
pub trait PreStartProcess {
    fn pre_start_process(&self, pid: Pid, master: &Connection, fatal: &FatalSender) -> Result<()>;
}

/// Lifecycle hooks of a container technology.
///
/// `prepare_config` runs in the starter before anything is spawned. Then
/// `create_container`, `post_start_process`, `monitor_container` and
/// `cleanup_container` run in the master, `start_process` runs in the
/// container process, `post_start_host` and `cleanup_host` run in the
/// host helpers.
pub trait Operations: Send + Sync {
    fn name(&self) -> &str;

    /// Validate the engine configuration and fill in how the container
    /// process must be built. Fails before any process exists.
    fn prepare_config(&mut self, config: &mut StarterConfig) -> Result<()>;

    /// Runs while the container process exists but has not executed the
    /// payload yet.
    fn create_container(&self, pid: Pid, rpc: &Connection) -> Result<()>;

    /// Replace the container process image, only returns on failure.
    fn start_process(&self, master: &Connection) -> Result<Infallible>;

    fn post_start_process(&self, _pid: Pid) -> Result<()> {
        Ok(())
    }

    fn post_start_host(&self) -> Result<()> {
        Ok(())
    }

    fn monitor_container(&self, pid: Pid, signals: &Receiver<Signal>) -> Result<ExitStatus>;

    fn cleanup_container(
        &self,
        _fatal: Option<&anyhow::Error>,
        _status: Option<ExitStatus>,
    ) -> Result<()> {
        Ok(())
    }

    fn cleanup_host(&self) -> Result<()> {
        Ok(())
    }

    fn host_helpers(&self) -> HostHelpers {
        HostHelpers::default()
    }

    fn pre_start(&self) -> Option<&dyn PreStartProcess> {
        None
    }
}

type Constructor = fn(&CommonConfig) -> Result<Box<dyn Operations>>;

const ENGINES: [(&str, Constructor); 2] = [
    (fakeroot::NAME, fakeroot::FakerootEngine::boxed),
    (native::NAME, native::NativeEngine::boxed),
];

/// Names of the engines built into the runtime.
pub fn registered() -> impl Iterator<Item = &'static str> {
    ENGINES.iter().map(|(name, _)| *name)
}

pub struct Engine {
    pub common: CommonConfig,
    pub ops: Box<dyn Operations>,
}

impl Engine {
    /// Look the engine up by `common.engine_name` and build it.
    pub fn new(common: CommonConfig) -> Result<Self> {
        let constructor = ENGINES
            .iter()
            .find(|(name, _)| *name == common.engine_name)
            .map(|(_, c)| *c)
            .ok_or_else(|| anyhow!("no engine registered with name {}", common.engine_name))?;
        let ops = constructor(&common)
            .with_context(|| format!("Failed to initialize {} engine", common.engine_name))?;
        Ok(Self { common, ops })
    }

    pub fn with_operations(common: CommonConfig, ops: Box<dyn Operations>) -> Self {
        Self { common, ops }
    }
}

fn to_cstrings(strings: &[String]) -> Result<Vec<CString>> {
    strings
        .iter()
        .map(|s| CString::new(s.as_bytes()).with_context(|| format!("Invalid string {:?}", s)))
        .collect()
}

/// Replace the current process image with `args[0]`. The path is used as
/// is, without PATH lookup.
pub fn execute(args: &[String], envs: &[String]) -> Result<Infallible> {
    let argv = to_cstrings(args)?;
    let path = argv
        .first()
        .ok_or_else(|| anyhow!("no command to execute provided"))?;
    let envp = to_cstrings(envs)?;
    execve(path, &argv, &envp).with_context(|| format!("Failed to execute {}", args[0]))
}
