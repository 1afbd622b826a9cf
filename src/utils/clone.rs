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

use anyhow::{anyhow, bail, Context, Result};
use libc::{pid_t, SIGCHLD};
use log::error;
use nix::{
    errno::errno,
    sched::{clone, CloneFlags},
    unistd::Pid,
};

use super::prctl;

bitflags::bitflags! {
    /// Namespace flags accepted by clone3(2).
    #[derive(Default)]
    pub struct Namespaces: u64 {
        const CGROUP = 0x02000000;
        const IPC = 0x08000000;
        const NET = 0x40000000;
        const MOUNT = 0x00020000;
        const PID = 0x20000000;
        const USER = 0x10000000;
        const UTS = 0x04000000;
    }
}

impl Namespaces {
    /// Parse a namespace name as used in container configurations.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "cgroup" => Ok(Namespaces::CGROUP),
            "ipc" => Ok(Namespaces::IPC),
            "net" | "network" => Ok(Namespaces::NET),
            "mnt" | "mount" => Ok(Namespaces::MOUNT),
            "pid" => Ok(Namespaces::PID),
            "user" => Ok(Namespaces::USER),
            "uts" => Ok(Namespaces::UTS),
            _ => bail!("Invalid namespace type: {}", name),
        }
    }

    fn clone_flags(&self) -> CloneFlags {
        CloneFlags::from_bits_truncate(self.bits() as libc::c_int)
    }
}

#[repr(C, align(8))]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pid_fd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Fork-like clone3(2): no new stack, the child continues from the call site.
#[derive(Default)]
pub struct Clone3 {
    namespaces: Namespaces,
    exit_signal: u64,
}

impl Clone3 {
    pub fn namespaces(&mut self, namespaces: Namespaces) -> &mut Self {
        self.namespaces = namespaces;
        self
    }

    pub fn exit_signal(&mut self, exit_signal: u64) -> &mut Self {
        self.exit_signal = exit_signal;
        self
    }

    pub fn call(&self) -> Result<Pid> {
        let clone_args = CloneArgs {
            flags: self.namespaces.bits(),
            exit_signal: self.exit_signal,
            ..Default::default()
        };

        // SAFETY: FFI call with valid arguments.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_clone3,
                &clone_args as *const CloneArgs,
                core::mem::size_of::<CloneArgs>(),
            )
        };
        if ret == -1 {
            bail!("clone3 error: errno {}", errno());
        }

        Ok(Pid::from_raw(
            pid_t::try_from(ret).with_context(|| "Invalid pid")?,
        ))
    }
}

/// Clone a child process into `namespaces` and run `cb` in it. The child
/// exits with the value returned by `cb`, an error exits with 255.
pub fn clone_process<F: FnMut() -> Result<i32>>(
    child_name: &str,
    namespaces: Namespaces,
    mut cb: F,
) -> Result<Pid> {
    let mut clone3 = Clone3::default();
    clone3.namespaces(namespaces).exit_signal(SIGCHLD as u64);

    let pid = match clone3.call() {
        Ok(pid) => pid,
        Err(_) => {
            // clone3() may not be supported by the kernel, fallback to clone().
            let mut stack = vec![0u8; 1024 * 1024];
            return clone(
                Box::new(|| {
                    if let Err(e) = prctl::set_name(child_name) {
                        error!("Failed to set process name: {}", e);
                    }
                    child_exit_code(cb())
                }),
                &mut stack,
                namespaces.clone_flags(),
                Some(SIGCHLD),
            )
            .map_err(|e| anyhow!("Clone error: errno {}", e));
        }
    };

    if pid.as_raw() != 0 {
        return Ok(pid);
    }

    if let Err(e) = prctl::set_name(child_name) {
        error!("Failed to set process name: {}", e);
    }
    std::process::exit(child_exit_code(cb()) as i32);
}

fn child_exit_code(ret: Result<i32>) -> isize {
    match ret {
        Ok(code) => code as isize,
        Err(e) => {
            error!("Child process exit with errors: {:?}", e);
            255
        }
    }
}
