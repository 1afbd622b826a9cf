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

use std::ffi::CString;

use anyhow::{bail, Context, Result};
use libc::{c_int, c_ulong, prctl};
use nix::{errno::errno, sys::signal::Signal};

#[allow(non_camel_case_types)]
enum PrctlOption {
    PR_SET_PDEATHSIG = 1,
    PR_SET_KEEPCAPS = 8,
    PR_SET_NAME = 15,
}

fn set_option(option: PrctlOption, arg: c_ulong) -> Result<()> {
    // SAFETY: FFI call with valid arguments.
    let ret = unsafe { prctl(option as c_int, arg, 0, 0, 0) };
    if ret != 0 {
        bail!("errno {}", errno());
    }
    Ok(())
}

/// Ask the kernel to deliver `signal` when the parent thread dies.
pub fn set_parent_death_signal(signal: Signal) -> Result<()> {
    set_option(PrctlOption::PR_SET_PDEATHSIG, signal as c_ulong)
}

pub fn set_keep_capabilities(keep_capabilities: bool) -> Result<()> {
    set_option(PrctlOption::PR_SET_KEEPCAPS, keep_capabilities as c_ulong)
}

pub fn set_name(name: &str) -> Result<()> {
    let binding = CString::new(name).with_context(|| "Invalid process name")?;
    set_option(PrctlOption::PR_SET_NAME, binding.as_ptr() as c_ulong)
}

#[cfg(test)]
mod tests {
    use rusty_fork::rusty_fork_test;

    use super::*;

    rusty_fork_test! {
        #[test]
        fn test_set_name() {
            set_name("ozstage-test").unwrap();
            let comm = std::fs::read_to_string("/proc/self/comm").unwrap();
            assert_eq!(comm.trim_end(), "ozstage-test");
            assert!(set_name("bad\0name").is_err());
        }

        #[test]
        fn test_set_parent_death_signal() {
            set_parent_death_signal(Signal::SIGTERM).unwrap();
            let mut sig: c_int = 0;
            // SAFETY: FFI call with valid arguments.
            let ret = unsafe { prctl(libc::PR_GET_PDEATHSIG, &mut sig as *mut c_int, 0, 0, 0) };
            assert_eq!(ret, 0);
            assert_eq!(sig, libc::SIGTERM);
        }
    }
}
