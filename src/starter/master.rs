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

// The master supervises one container process:
//
//      create-container  ---+
//      start-container   ---+--> fatal channel --> first value decides
//      monitor-container ---+
//
// then runs the container cleanup, the host cleanup handshake, and exits
// like the container did.

use std::{
    os::unix::io::RawFd,
    process::exit,
    sync::{mpsc::Receiver, Arc, OnceLock},
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, warn};
use nix::{
    sys::signal::{raise, signal, SigHandler, Signal},
    unistd::{close, Pid},
};

use crate::{
    engine::{Engine, ExitStatus, FatalSender},
    utils::{
        channel::{COMPLETE, FAILURE},
        logger, Connection, SignalQueue, StageErr,
    },
};

/// Substring of the error returned when an encrypted image can't be opened.
const INVALID_PASSPHRASE: &str = "no key available with this passphrase";

/// Descriptors handed to the master. A negative helper socket means the
/// helper was not spawned.
#[derive(Debug, Clone, Copy)]
pub struct MasterSockets {
    pub rpc: RawFd,
    pub master: RawFd,
    pub post_start: RawFd,
    pub cleanup: RawFd,
}

fn optional_fd(fd: RawFd) -> Option<RawFd> {
    if fd < 0 {
        None
    } else {
        Some(fd)
    }
}

/// Handle on the container image kept open by the master.
pub trait ImageFile: Send {
    /// Descriptor the helper processes must not inherit, if any.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn close(self: Box<Self>) -> Result<()>;
}

pub struct ImageFd(pub RawFd);

impl ImageFile for ImageFd {
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.0)
    }

    fn close(self: Box<Self>) -> Result<()> {
        debug!("Close image fd: {}", self.0);
        close(self.0).with_context(|| format!("Failed to close image fd {}", self.0))
    }
}

/// Host cleanup trigger. Both the socket and the image are consumed by the
/// first `run`, later calls do nothing.
pub struct HostCleanup {
    socket: Option<RawFd>,
    image: Option<Box<dyn ImageFile>>,
}

impl HostCleanup {
    pub fn new(socket: RawFd, image: Option<Box<dyn ImageFile>>) -> Self {
        Self {
            socket: optional_fd(socket),
            image,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        // Without a cleanup helper there is nobody to release the image.
        let socket = match self.socket.take() {
            Some(s) => s,
            None => return Ok(()),
        };

        // A FUSE mounted image can't be unmounted while the master holds it.
        if let Some(image) = self.image.take() {
            if let Err(e) = image.close() {
                error!("failed to close image: {:#}", e);
            }
        }

        let conn = Connection::wrap(socket, "cleanup-socket")?;
        conn.signal(COMPLETE)
            .with_context(|| "error signaling host cleanup")?;
        match conn.wait().with_context(|| "error waiting for host cleanup")? {
            Some(COMPLETE) => {
                debug!("host cleanup completed");
                Ok(())
            }
            Some(_) => bail!("host cleanup failed"),
            None => bail!("error waiting for host cleanup: EOF"),
        }
    }
}

fn host_post_start(socket: Option<RawFd>) -> Result<()> {
    let socket = match socket {
        Some(s) => s,
        None => return Ok(()),
    };

    let conn = Connection::wrap(socket, "post-start-socket")?;
    conn.signal(COMPLETE)
        .with_context(|| "error signaling host post start tasks")?;
    match conn
        .wait()
        .with_context(|| "error waiting for host post start tasks")?
    {
        Some(COMPLETE) => {
            debug!("host post start tasks completed");
            Ok(())
        }
        Some(_) => bail!("host post start tasks failed"),
        None => bail!("error waiting for host post start tasks: EOF"),
    }
}

fn translate_create_error(err: anyhow::Error) -> anyhow::Error {
    if format!("{:#}", err).contains(INVALID_PASSPHRASE) {
        debug!("{:#}", err);
        return anyhow!("failed to decrypt, ensure you have supplied appropriate key material");
    }
    err
}

/// Run the engine's privileged setup against the rpc socket. Reports only
/// failures.
pub fn create_container(rpc_socket: RawFd, pid: Pid, engine: &Engine, fatal: &FatalSender) {
    let rpc = match Connection::wrap(rpc_socket, "rpc-socket") {
        Ok(c) => c,
        Err(e) => return fatal.report(e),
    };

    if let Err(e) = engine.ops.create_container(pid, &rpc) {
        fatal.report(translate_create_error(e).context("container creation failed"));
    }
}

/// Follow the container process up to the execution of its payload, then
/// run the post start hooks.
///
/// A failure of the container process itself is never reported here: the
/// process exits and the monitor reports its status.
pub fn start_container(
    master_socket: RawFd,
    post_start_socket: Option<RawFd>,
    pid: Pid,
    engine: &Engine,
    fatal: &FatalSender,
) {
    let conn = match Connection::wrap(master_socket, "master-socket") {
        Ok(c) => c,
        Err(e) => return fatal.report(e),
    };

    if let Some(pre_start) = engine.ops.pre_start() {
        match conn.wait() {
            Ok(Some(FAILURE)) => {
                debug!("container process reported an error, waiting status");
                return;
            }
            Ok(Some(_)) => (),
            Ok(None) => {
                debug!("container process was interrupted, waiting status");
                return;
            }
            Err(e) => return fatal.report(e),
        }
        if let Err(e) = pre_start.pre_start_process(pid, &conn, fatal) {
            return fatal.report(e.context("pre start process failed"));
        }
    }

    // EOF is the expected outcome: the socket is closed on exec.
    match conn.wait() {
        Ok(Some(FAILURE)) => {
            debug!("container process reported an error, waiting status");
            return;
        }
        Err(e) => {
            debug!("container process reported an error, waiting status: {:#}", e);
            return;
        }
        Ok(_) => (),
    }

    if let Err(e) = host_post_start(post_start_socket) {
        return fatal.report(e.context("host post start process failed"));
    }
    if let Err(e) = engine.ops.post_start_process(pid) {
        fatal.report(e.context("post start process failed"));
    }
}

fn spawn_phase<F>(name: &'static str, fatal: &FatalSender, f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = thread::Builder::new().name(name.to_string()).spawn(f) {
        fatal.report(anyhow!(e).context(StageErr::SpawnThread(name)));
    }
}

/// Supervise the container process until the outcome is known, and clean
/// up. Returns the container exit status, or the fatal error deciding the
/// outcome.
pub fn run_master(
    sockets: MasterSockets,
    pid: Pid,
    image: Option<Box<dyn ImageFile>>,
    engine: Arc<Engine>,
    signals: Receiver<Signal>,
) -> Result<ExitStatus> {
    let (fatal_tx, fatal_rx) = FatalSender::channel();
    let status = Arc::new(OnceLock::new());

    let (e, tx) = (engine.clone(), fatal_tx.clone());
    spawn_phase("create-container", &fatal_tx, move || {
        create_container(sockets.rpc, pid, &e, &tx)
    });

    let (e, tx) = (engine.clone(), fatal_tx.clone());
    spawn_phase("start-container", &fatal_tx, move || {
        start_container(sockets.master, optional_fd(sockets.post_start), pid, &e, &tx)
    });

    let (e, tx, st) = (engine.clone(), fatal_tx.clone(), status.clone());
    spawn_phase("monitor-container", &fatal_tx, move || {
        match e.ops.monitor_container(pid, &signals) {
            Ok(s) => {
                let _ = st.set(s);
                tx.send(None);
            }
            Err(e) => tx.report(e),
        }
    });
    // Phases hold the only senders left, a closed channel means none of
    // them reported.
    drop(fatal_tx);

    let fatal = fatal_rx
        .recv()
        .unwrap_or_else(|_| Some(anyhow!("container phases ended without an outcome")));
    let status = status.get().copied();

    if let Err(e) = engine.ops.cleanup_container(fatal.as_ref(), status) {
        error!("Container cleanup failed: {:#}", e);
    }

    let mut host_cleanup = HostCleanup::new(sockets.cleanup, image);
    if let Err(e) = host_cleanup.run() {
        error!("Unprivileged host cleanup failed: {:#}", e);
    }

    while let Ok(outcome) = fatal_rx.try_recv() {
        if let Some(e) = outcome {
            warn!("Ignoring error reported after the outcome was decided: {:#}", e);
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => status.ok_or_else(|| anyhow!("container exit status was not collected")),
    }
}

/// Exit the way the container process did. A container killed by a signal
/// gets the same signal raised against the master, with its default
/// disposition, and 128 + signal if the signal doesn't terminate.
pub fn terminate(status: ExitStatus) -> ! {
    match status {
        ExitStatus::Signaled(sig) => {
            debug!("Child exited due to signal {}", sig as i32);
            // SIGKILL disposition can't be changed and is always fatal.
            // SAFETY: restoring the default disposition installs no handler.
            if sig == Signal::SIGKILL || unsafe { signal(sig, SigHandler::SigDfl) }.is_ok() {
                let _ = raise(sig);
            }
        }
        ExitStatus::Exited(code) => debug!("Child exited with exit status {}", code),
    }
    exit(status.exit_code());
}

/// Master process entry, called once the container process exists. Never
/// returns.
pub fn master(
    sockets: MasterSockets,
    pid: Pid,
    image: Option<Box<dyn ImageFile>>,
    engine: Arc<Engine>,
) -> ! {
    // Installed before any phase thread exists so that every thread blocks
    // the queued signals.
    let (queue, signals) = match SignalQueue::install() {
        Ok(q) => q,
        Err(e) => logger::fatal(&e),
    };

    let status = match run_master(sockets, pid, image, engine, signals) {
        Ok(s) => s,
        Err(e) => logger::fatal(&e),
    };

    if let Err(e) = queue.reset() {
        warn!("Failed to reset signal mask: {:#}", e);
    }
    terminate(status)
}
