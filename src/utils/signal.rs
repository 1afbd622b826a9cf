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
    sync::mpsc::{sync_channel, Receiver, TrySendError},
    thread,
};

use anyhow::{Context, Result};
use log::{debug, error, warn};
use nix::sys::signal::{pthread_sigmask, signal, SigHandler, SigSet, SigmaskHow, Signal};

use super::StageErr;

/// Signals queued before the monitor drains them.
pub const SIGNAL_QUEUE_SIZE: usize = 64;

// Synchronous faults belong to the thread which caused them, and SIGKILL and
// SIGSTOP can't be caught at all.
const UNQUEUED: [Signal; 7] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGTRAP,
    Signal::SIGKILL,
    Signal::SIGSTOP,
];

/// Set of signals routed through the queue.
pub fn forwardable() -> SigSet {
    let mut set = SigSet::empty();
    for sig in Signal::iterator().filter(|s| !UNQUEUED.contains(s)) {
        set.add(sig);
    }
    set
}

/// Process-wide signal queue.
///
/// Forwardable signals are blocked on the calling thread, and every thread
/// spawned afterwards inherits the mask, so none of them is ever delivered
/// asynchronously. A dedicated thread picks them up with sigwait(2) and
/// pushes them into a bounded channel, which the monitor drains once it runs.
/// Signals arriving before the monitor starts stay in the channel.
pub struct SignalQueue {
    mask: SigSet,
}

impl SignalQueue {
    /// Must be called from the main thread before any other thread is
    /// spawned. Returns the queue handle and the receiving end of the queue.
    pub fn install() -> Result<(Self, Receiver<Signal>)> {
        let mask = forwardable();

        // SAFETY: restoring the default disposition installs no handler.
        unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) }
            .with_context(|| "Failed to reset SIGCHLD disposition")?;
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .with_context(|| "Failed to block signals")?;

        let (sender, receiver) = sync_channel(SIGNAL_QUEUE_SIZE);
        thread::Builder::new()
            .name("signal-queue".to_string())
            .spawn(move || loop {
                let sig = match mask.wait() {
                    Ok(sig) => sig,
                    Err(e) => {
                        error!("Failed to wait for signals: {}", e);
                        return;
                    }
                };
                match sender.try_send(sig) {
                    Ok(()) => debug!("Queued signal {}", sig),
                    Err(TrySendError::Full(sig)) => {
                        warn!("Signal queue is full, dropping {}", sig)
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            })
            .with_context(|| StageErr::SpawnThread("signal-queue"))?;

        Ok((Self { mask }, receiver))
    }

    /// Unblock the queued signals on the calling thread, giving them back
    /// their default behavior.
    pub fn reset(&self) -> Result<()> {
        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&self.mask), None)
            .with_context(|| "Failed to unblock signals")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::{
        sys::{
            signal::{kill, raise},
            wait::WaitStatus,
        },
        unistd::getpid,
    };
    use rusty_fork::rusty_fork_test;

    use super::*;
    use crate::utils::test_utils::in_child_process;

    #[test]
    fn test_forwardable_signals() {
        let set = forwardable();
        assert!(set.contains(Signal::SIGTERM));
        assert!(set.contains(Signal::SIGCHLD));
        assert!(set.contains(Signal::SIGURG));
        assert!(set.contains(Signal::SIGUSR1));
        assert!(!set.contains(Signal::SIGSEGV));
        assert!(!set.contains(Signal::SIGKILL));
    }

    // The queue must be installed by the only thread of a process, so every
    // scenario runs in a freshly forked child.
    rusty_fork_test! {
        #[test]
        fn test_signal_queue_delivers_in_order() {
            let status = in_child_process(|| {
                let (_queue, signals) = SignalQueue::install().unwrap();

                kill(getpid(), Signal::SIGUSR1).unwrap();
                let sig = signals.recv_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(sig, Signal::SIGUSR1);

                kill(getpid(), Signal::SIGHUP).unwrap();
                let sig = signals.recv_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(sig, Signal::SIGHUP);
            });
            assert!(matches!(status, WaitStatus::Exited(_, 0)));
        }

        #[test]
        fn test_signal_queue_keeps_early_signals() {
            let status = in_child_process(|| {
                let (_queue, signals) = SignalQueue::install().unwrap();

                // Delivered while nobody reads the channel yet.
                kill(getpid(), Signal::SIGTERM).unwrap();
                std::thread::sleep(Duration::from_millis(100));
                let sig = signals.recv_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(sig, Signal::SIGTERM);
            });
            assert!(matches!(status, WaitStatus::Exited(_, 0)));
        }

        #[test]
        fn test_signal_queue_reset() {
            let status = in_child_process(|| {
                let (queue, _signals) = SignalQueue::install().unwrap();
                queue.reset().unwrap();

                let mut current = SigSet::empty();
                pthread_sigmask(SigmaskHow::SIG_BLOCK, None, Some(&mut current)).unwrap();
                assert!(!current.contains(Signal::SIGTERM));

                // SIGWINCH is ignored by default, raising it now is harmless.
                raise(Signal::SIGWINCH).unwrap();
            });
            assert!(matches!(status, WaitStatus::Exited(_, 0)));
        }
    }
}
