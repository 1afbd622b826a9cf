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

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use anyhow::{anyhow, Result};
use log::debug;
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};

/// Room for every phase reporting to the master, so no report ever blocks.
pub const FATAL_CHANNEL_SIZE: usize = 4;

/// How the container process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// Shell convention: the exit code, or 128 plus the signal number.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(sig) => 128 + *sig as i32,
        }
    }

    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(ExitStatus::Signaled(sig)),
            _ => None,
        }
    }
}

/// Producer side of the fatal channel.
///
/// `None` is a successful outcome, `Some(err)` a fatal one. The master
/// only acts on the first value it receives.
#[derive(Clone)]
pub struct FatalSender(SyncSender<Option<anyhow::Error>>);

impl FatalSender {
    pub fn channel() -> (Self, Receiver<Option<anyhow::Error>>) {
        let (sender, receiver) = sync_channel(FATAL_CHANNEL_SIZE);
        (Self(sender), receiver)
    }

    pub fn send(&self, outcome: Option<anyhow::Error>) {
        match self.0.try_send(outcome) {
            Ok(()) => (),
            Err(TrySendError::Full(Some(e))) | Err(TrySendError::Disconnected(Some(e))) => {
                debug!("Fatal outcome already decided, discarding: {:#}", e)
            }
            Err(_) => debug!("Fatal outcome already decided"),
        }
    }

    pub fn report(&self, err: anyhow::Error) {
        self.send(Some(err));
    }
}

/// Reap every exited child, host helpers included, until `pid` is found or
/// none is left.
fn reap(pid: Pid) -> Result<Option<ExitStatus>> {
    loop {
        let status = waitpid(None, Some(WaitPidFlag::WNOHANG))
            .map_err(|e| anyhow!("error while waiting for child: {}", e))?;
        match status.pid() {
            None => return Ok(None),
            Some(child) if child == pid => return Ok(ExitStatus::from_wait_status(status)),
            Some(child) => debug!("Reaped helper process {}: {:?}", child, status),
        }
    }
}

/// Wait for `pid` to terminate and forward to it every signal taken from
/// `signals`.
///
/// SIGCHLD is never forwarded, it triggers a non-blocking reap instead.
/// SIGURG is dropped. The queue keeps signals received before this call,
/// so a child which already exited is seen by the first reap.
pub fn monitor_process(pid: Pid, signals: &Receiver<Signal>) -> Result<ExitStatus> {
    debug!("Waiting for container process {}", pid);
    if let Some(status) = reap(pid)? {
        return Ok(status);
    }

    loop {
        let sig = signals
            .recv()
            .map_err(|_| anyhow!("signal queue closed while waiting for {}", pid))?;
        match sig {
            Signal::SIGCHLD => {
                if let Some(status) = reap(pid)? {
                    debug!("Wait for process {} complete with status {:?}", pid, status);
                    return Ok(status);
                }
            }
            Signal::SIGURG => (),
            _ => {
                debug!("Forwarding {} to container process {}", sig, pid);
                kill(pid, sig).map_err(|_| anyhow!("interrupted by signal {}", sig))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{process::exit, thread, time::Duration};

    use nix::unistd::{fork, pause, ForkResult};
    use rusty_fork::rusty_fork_test;

    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(ExitStatus::Exited(0).exit_code(), 0);
        assert_eq!(ExitStatus::Exited(3).exit_code(), 3);
        assert_eq!(ExitStatus::Signaled(Signal::SIGKILL).exit_code(), 137);
        assert_eq!(ExitStatus::Signaled(Signal::SIGTERM).exit_code(), 143);
    }

    #[test]
    fn test_fatal_sender_first_value_wins() {
        let (sender, receiver) = FatalSender::channel();
        sender.report(anyhow!("first"));
        sender.send(None);
        sender.report(anyhow!("third"));

        let first = receiver.recv().unwrap();
        assert_eq!(first.unwrap().to_string(), "first");
        assert!(receiver.recv().unwrap().is_none());
    }

    #[test]
    fn test_fatal_sender_never_blocks() {
        let (sender, receiver) = FatalSender::channel();
        for i in 0..FATAL_CHANNEL_SIZE * 2 {
            sender.report(anyhow!("error {}", i));
        }
        drop(receiver);
        sender.send(None);
    }

    rusty_fork_test! {
        #[test]
        fn test_monitor_exited_child() {
            let (tx, rx) = sync_channel(4);
            // SAFETY: the child exits right away.
            let child = match unsafe { fork() }.unwrap() {
                ForkResult::Child => exit(3),
                ForkResult::Parent { child } => child,
            };
            // The child may be reaped by the first non-blocking wait, or after
            // the SIGCHLD notification.
            thread::sleep(Duration::from_millis(100));
            tx.send(Signal::SIGCHLD).unwrap();
            assert_eq!(monitor_process(child, &rx).unwrap(), ExitStatus::Exited(3));
        }

        #[test]
        fn test_monitor_forwards_signals() {
            let (tx, rx) = sync_channel(4);
            // SAFETY: the child only waits for a signal.
            let child = match unsafe { fork() }.unwrap() {
                ForkResult::Child => loop {
                    pause();
                },
                ForkResult::Parent { child } => child,
            };

            tx.send(Signal::SIGURG).unwrap();
            tx.send(Signal::SIGTERM).unwrap();
            let notifier = thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                tx.send(Signal::SIGCHLD).unwrap();
                tx
            });
            let status = monitor_process(child, &rx).unwrap();
            assert_eq!(status, ExitStatus::Signaled(Signal::SIGTERM));
            notifier.join().unwrap();
        }

        #[test]
        fn test_monitor_reaps_helpers() {
            let (tx, rx) = sync_channel(4);
            // SAFETY: the child exits right away.
            let helper = match unsafe { fork() }.unwrap() {
                ForkResult::Child => exit(0),
                ForkResult::Parent { child } => child,
            };
            // SAFETY: the child only waits for a signal.
            let child = match unsafe { fork() }.unwrap() {
                ForkResult::Child => loop {
                    pause();
                },
                ForkResult::Parent { child } => child,
            };

            thread::sleep(Duration::from_millis(100));
            tx.send(Signal::SIGCHLD).unwrap();
            tx.send(Signal::SIGTERM).unwrap();
            let notifier = thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                tx.send(Signal::SIGCHLD).unwrap();
                tx
            });
            let status = monitor_process(child, &rx).unwrap();
            assert_eq!(status, ExitStatus::Signaled(Signal::SIGTERM));
            notifier.join().unwrap();

            // No zombie left behind.
            assert_eq!(
                waitpid(helper, Some(WaitPidFlag::WNOHANG)),
                Err(nix::errno::Errno::ECHILD)
            );
        }

        #[test]
        fn test_monitor_unknown_child() {
            let (_tx, rx) = sync_channel::<Signal>(4);
            let err = monitor_process(Pid::from_raw(i32::MAX), &rx).unwrap_err();
            assert!(err.to_string().starts_with("error while waiting for child"));
        }
    }
}
