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

// One byte handshake between processes sharing a unix socket pair:
//
//      writer              |       reader
//                          |
//      signal('c') ->      |   wait() == Some('c')     proceed / complete
//      signal('f') ->      |   wait() == Some('f')     explicit failure
//      close / exit ->     |   wait() == None          peer gone, ask wait status

use std::{
    io::{ErrorKind, Read},
    os::unix::{
        io::{AsRawFd, FromRawFd, RawFd},
        net::UnixStream,
    },
};

use anyhow::{bail, Context, Result};
use nix::{
    errno::Errno,
    sys::{
        socket::{send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType},
        stat::{fstat, SFlag},
    },
};

use super::StageErr;

/// Peer finished its task.
pub const COMPLETE: u8 = b'c';
/// Peer reported an error, details travel through another path.
pub const FAILURE: u8 = b'f';

/// Create a pair of connected sockets. Both ends are close-on-exec, so an
/// end held by the container process goes away once it executes the payload.
pub fn pair() -> Result<(RawFd, RawFd)> {
    let fds = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .with_context(|| "Failed to create socket pair")?;
    Ok(fds)
}

#[derive(Debug)]
pub struct Connection {
    name: &'static str,
    stream: UnixStream,
}

impl Connection {
    /// Take ownership of an inherited socket descriptor.
    ///
    /// The descriptor is checked before ownership is taken: a negative number
    /// or a descriptor which is not a socket is reported and left untouched.
    pub fn wrap(fd: RawFd, name: &'static str) -> Result<Self> {
        if fd < 0 {
            bail!(StageErr::BadDescriptor(name));
        }
        let stat = fstat(fd).with_context(|| StageErr::BadDescriptor(name))?;
        if SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT != SFlag::S_IFSOCK {
            bail!(StageErr::NotSocket(name));
        }

        Ok(Self {
            name,
            // SAFETY: fd is a valid socket and from now on only owned by the stream.
            stream: unsafe { UnixStream::from_raw_fd(fd) },
        })
    }

    /// Write exactly one byte. Any error means the peer is gone or broken.
    ///
    /// MSG_NOSIGNAL keeps a closed peer from raising SIGPIPE, which would
    /// otherwise end up in the master signal queue.
    pub fn signal(&self, byte: u8) -> Result<()> {
        loop {
            match send(self.stream.as_raw_fd(), &[byte], MsgFlags::MSG_NOSIGNAL) {
                Ok(1) => return Ok(()),
                Ok(_) => bail!(StageErr::WriteSocket(self.name)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).with_context(|| StageErr::WriteSocket(self.name)),
            }
        }
    }

    /// Block until one byte arrives. `None` means the peer closed its end
    /// without writing anything.
    pub fn wait(&self) -> Result<Option<u8>> {
        let mut data = [0u8; 1];
        loop {
            match (&self.stream).read(&mut data) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(data[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).with_context(|| StageErr::ReadSocket(self.name)),
            }
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, thread};

    use nix::unistd::close;

    use super::*;

    #[test]
    fn test_wrap_bad_descriptor() {
        let file = File::open("/dev/null").unwrap();
        assert!(Connection::wrap(-1, "test-socket").is_err());
        let err = Connection::wrap(file.as_raw_fd(), "test-socket").unwrap_err();
        assert_eq!(err.to_string(), "test-socket file descriptor is not a unix socket");
        // A rejected descriptor must not be closed.
        assert!(fstat(file.as_raw_fd()).is_ok());
    }

    #[test]
    fn test_signal_wait() {
        for byte in [COMPLETE, FAILURE] {
            let (left, right) = pair().unwrap();
            let writer = Connection::wrap(left, "left").unwrap();
            let reader = Connection::wrap(right, "right").unwrap();

            writer.signal(byte).unwrap();
            assert_eq!(reader.wait().unwrap(), Some(byte));

            // Both directions work on the same pair.
            reader.signal(byte).unwrap();
            assert_eq!(writer.wait().unwrap(), Some(byte));
        }
    }

    #[test]
    fn test_wait_eof() {
        let (left, right) = pair().unwrap();
        let reader = Connection::wrap(right, "right").unwrap();
        close(left).unwrap();
        assert_eq!(reader.wait().unwrap(), None);
    }

    #[test]
    fn test_wait_eof_after_peer_exit() {
        let (left, right) = pair().unwrap();
        let reader = Connection::wrap(right, "right").unwrap();
        let peer = thread::spawn(move || {
            let writer = Connection::wrap(left, "left").unwrap();
            writer.signal(COMPLETE).unwrap();
        });
        peer.join().unwrap();

        // The byte written before closing is seen first, then EOF, never a
        // spurious byte.
        assert_eq!(reader.wait().unwrap(), Some(COMPLETE));
        assert_eq!(reader.wait().unwrap(), None);
    }

    #[test]
    fn test_signal_closed_peer() {
        let (left, right) = pair().unwrap();
        let writer = Connection::wrap(left, "left").unwrap();
        close(right).unwrap();
        assert!(writer.signal(COMPLETE).is_err());
    }
}
