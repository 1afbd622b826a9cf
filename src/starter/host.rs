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
    os::unix::io::RawFd,
    sync::{mpsc::channel, Arc},
    thread,
};

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use nix::sys::signal::{SigSet, Signal};

use crate::{
    engine::Engine,
    utils::{
        channel::{COMPLETE, FAILURE},
        Connection, StageErr,
    },
};

/// Run the engine post start hook in the host namespaces once the master
/// asks for it.
pub fn post_start_host(socket: RawFd, engine: &Engine) -> Result<()> {
    let conn = Connection::wrap(socket, "post-start-socket")?;
    if conn.wait()?.is_none() {
        bail!("master exited before requesting post start tasks");
    }

    debug!("Running {} engine host post start tasks", engine.ops.name());
    match engine.ops.post_start_host() {
        Ok(()) => conn.signal(COMPLETE),
        Err(e) => {
            conn.signal(FAILURE)?;
            Err(e.context("host post start tasks failed"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    /// The master asked for cleanup and waits for the outcome.
    Clean,
    /// The master is gone.
    Unclean,
}

fn wait_shutdown(conn: &Arc<Connection>) -> Result<Shutdown> {
    let (tx, rx) = channel();

    let reader = conn.clone();
    let socket_tx = tx.clone();
    thread::Builder::new()
        .name("cleanup-socket".to_string())
        .spawn(move || {
            let shutdown = match reader.wait() {
                Ok(Some(_)) => Shutdown::Clean,
                Ok(None) => Shutdown::Unclean,
                Err(e) => {
                    error!("{:#}", e);
                    Shutdown::Unclean
                }
            };
            let _ = socket_tx.send(shutdown);
        })
        .with_context(|| StageErr::SpawnThread("cleanup-socket"))?;

    thread::Builder::new()
        .name("cleanup-signal".to_string())
        .spawn(move || {
            let mut set = SigSet::empty();
            set.add(Signal::SIGTERM);
            match set.wait() {
                Ok(sig) => debug!("Cleanup helper received {}", sig),
                Err(e) => error!("Failed to wait for SIGTERM: {}", e),
            }
            let _ = tx.send(Shutdown::Unclean);
        })
        .with_context(|| StageErr::SpawnThread("cleanup-signal"))?;

    rx.recv()
        .with_context(|| "cleanup triggers ended without a notification")
}

/// Cleanup helper main loop. Runs the engine host cleanup exactly once,
/// either when the master asks for it or when the master dies, and returns
/// the helper exit code.
pub fn cleanup_host(socket: RawFd, engine: &Engine) -> i32 {
    // Blocked before any thread exists, SIGTERM is then only seen by the
    // signal thread.
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    if let Err(e) = mask.thread_block() {
        error!("Failed to block SIGTERM: {}", e);
        return 1;
    }

    let conn = match Connection::wrap(socket, "cleanup-socket") {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
    };
    let shutdown = match wait_shutdown(&conn) {
        Ok(s) => s,
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
    };

    info!(
        "Running {} engine host cleanup ({:?} shutdown)",
        engine.ops.name(),
        shutdown
    );
    let result = engine.ops.cleanup_host();
    if let Err(e) = &result {
        error!("Host cleanup failed: {:#}", e);
    }

    if shutdown == Shutdown::Clean {
        let reply = if result.is_ok() { COMPLETE } else { FAILURE };
        if let Err(e) = conn.signal(reply) {
            error!("{:#}", e);
            return 1;
        }
    }

    match result {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        fs::{read_to_string, write},
        path::PathBuf,
        process::exit,
        sync::mpsc::Receiver,
        thread::sleep,
        time::Duration,
    };

    use anyhow::anyhow;
    use nix::{
        sys::{
            signal::kill,
            wait::{waitpid, WaitStatus},
        },
        unistd::{close, fork, ForkResult, Pid},
    };
    use rusty_fork::rusty_fork_test;

    use super::*;
    use crate::{
        engine::{CommonConfig, ExitStatus, Operations},
        starter::StarterConfig,
        utils::{channel::pair, test_utils::fixture_dir},
    };

    /// Engine whose host hooks append their name to a marker file.
    struct HookEngine {
        marker: PathBuf,
        fail: bool,
    }

    impl HookEngine {
        fn hook(&self, name: &str) -> Result<()> {
            let mut content = read_to_string(&self.marker).unwrap_or_default();
            content.push_str(name);
            content.push('\n');
            write(&self.marker, content)?;
            if self.fail {
                return Err(anyhow!("{} failed", name));
            }
            Ok(())
        }
    }

    impl Operations for HookEngine {
        fn name(&self) -> &str {
            "hook"
        }

        fn prepare_config(&mut self, _config: &mut StarterConfig) -> Result<()> {
            Ok(())
        }

        fn create_container(&self, _pid: Pid, _rpc: &Connection) -> Result<()> {
            Ok(())
        }

        fn start_process(&self, _master: &Connection) -> Result<Infallible> {
            bail!("not a real engine")
        }

        fn post_start_host(&self) -> Result<()> {
            self.hook("post-start")
        }

        fn monitor_container(&self, _pid: Pid, _signals: &Receiver<Signal>) -> Result<ExitStatus> {
            bail!("not a real engine")
        }

        fn cleanup_host(&self) -> Result<()> {
            self.hook("cleanup")
        }
    }

    fn hook_engine(marker: PathBuf, fail: bool) -> Engine {
        let common = CommonConfig {
            engine_name: "hook".to_string(),
            ..Default::default()
        };
        Engine::with_operations(common, Box::new(HookEngine { marker, fail }))
    }

    #[test]
    fn test_post_start_host() {
        let dir = fixture_dir("post_start_host");
        let marker = dir.join("marker");

        let engine = hook_engine(marker.clone(), false);
        let (helper, master) = pair().unwrap();
        let master = Connection::wrap(master, "master").unwrap();
        master.signal(COMPLETE).unwrap();
        post_start_host(helper, &engine).unwrap();
        assert_eq!(master.wait().unwrap(), Some(COMPLETE));
        assert_eq!(read_to_string(&marker).unwrap(), "post-start\n");

        let engine = hook_engine(marker.clone(), true);
        let (helper, master) = pair().unwrap();
        let master = Connection::wrap(master, "master").unwrap();
        master.signal(COMPLETE).unwrap();
        let err = post_start_host(helper, &engine).unwrap_err();
        assert_eq!(format!("{:#}", err), "host post start tasks failed: post-start failed");
        assert_eq!(master.wait().unwrap(), Some(FAILURE));

        // No request, no hook.
        let (helper, master) = pair().unwrap();
        close(master).unwrap();
        assert!(post_start_host(helper, &engine).is_err());
        assert_eq!(read_to_string(&marker).unwrap(), "post-start\npost-start\n");
    }

    rusty_fork_test! {
        #[test]
        fn test_cleanup_host_clean_shutdown() {
            let dir = fixture_dir("cleanup_host_clean");
            let marker = dir.join("marker");

            let engine = hook_engine(marker.clone(), false);
            let (helper, master) = pair().unwrap();
            let master = Connection::wrap(master, "master").unwrap();
            master.signal(COMPLETE).unwrap();
            assert_eq!(cleanup_host(helper, &engine), 0);
            assert_eq!(master.wait().unwrap(), Some(COMPLETE));
            assert_eq!(read_to_string(&marker).unwrap(), "cleanup\n");

            let engine = hook_engine(marker.clone(), true);
            let (helper, master) = pair().unwrap();
            let master = Connection::wrap(master, "master").unwrap();
            master.signal(COMPLETE).unwrap();
            assert_eq!(cleanup_host(helper, &engine), 1);
            assert_eq!(master.wait().unwrap(), Some(FAILURE));
        }

        #[test]
        fn test_cleanup_host_master_gone() {
            let dir = fixture_dir("cleanup_host_eof");
            let marker = dir.join("marker");

            let engine = hook_engine(marker.clone(), false);
            let (helper, master) = pair().unwrap();
            close(master).unwrap();
            assert_eq!(cleanup_host(helper, &engine), 0);
            assert_eq!(read_to_string(&marker).unwrap(), "cleanup\n");
        }

        #[test]
        fn test_cleanup_host_sigterm() {
            let dir = fixture_dir("cleanup_host_sigterm");
            let marker = dir.join("marker");
            let (helper, master) = pair().unwrap();

            // Inherited by the child, the signal can't arrive too early.
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGTERM);
            mask.thread_block().unwrap();

            // SAFETY: the child runs the helper and exits.
            match unsafe { fork() }.unwrap() {
                ForkResult::Child => {
                    let _ = close(master);
                    let engine = hook_engine(marker, false);
                    exit(cleanup_host(helper, &engine));
                }
                ForkResult::Parent { child } => {
                    close(helper).unwrap();
                    let master = Connection::wrap(master, "master").unwrap();
                    sleep(Duration::from_millis(100));
                    kill(child, Signal::SIGTERM).unwrap();

                    assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
                    assert_eq!(read_to_string(&marker).unwrap(), "cleanup\n");
                    // Nothing written back on the unclean path.
                    assert_eq!(master.wait().unwrap(), None);
                }
            }
        }
    }
}
