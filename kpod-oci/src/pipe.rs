//! Sync and start pipes shared with the monitor.
//!
//! The sync pipe carries JSON from the monitor to us; the start pipe
//! carries a single [`StartSignal`] the other way. Each pipe owns both
//! ends until the child end is handed to the monitor with `take_child`.

use std::io;
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::{pipe2, write};
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe::Receiver;

const READ_CHUNK: usize = 4096;

/// Tells the monitor that cgroup placement is done and it may fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartSignal;

impl StartSignal {
    const BYTE: u8 = 0;
}

/// Monitor → supervisor channel.
#[derive(Debug)]
pub struct SyncPipe {
    parent: OwnedFd,
    child: Option<OwnedFd>,
}

impl SyncPipe {
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            parent: read,
            child: Some(write),
        })
    }

    /// Write end for the monitor. Only the first call returns it.
    pub fn take_child(&mut self) -> io::Result<OwnedFd> {
        take(&mut self.child)
    }

    /// Read the first JSON value the monitor sends.
    ///
    /// Returns `Ok(None)` if the pipe closes before any data arrived.
    /// The child end must have been taken and dropped, otherwise EOF never
    /// comes.
    pub async fn read_message<T: DeserializeOwned>(mut self) -> io::Result<Option<T>> {
        drop(self.child.take());
        let mut rx = Receiver::from_owned_fd(self.parent)?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = rx.read(&mut chunk).await?;
            buf.extend_from_slice(&chunk[..n]);
            let eof = n == 0;

            match serde_json::Deserializer::from_slice(&buf)
                .into_iter::<T>()
                .next()
            {
                Some(Ok(value)) => return Ok(Some(value)),
                Some(Err(e)) if e.is_eof() && !eof => continue,
                Some(Err(e)) => return Err(e.into()),
                None if eof => return Ok(None),
                None => continue,
            }
        }
    }
}

/// Supervisor → monitor channel.
#[derive(Debug)]
pub struct StartPipe {
    parent: OwnedFd,
    child: Option<OwnedFd>,
}

impl StartPipe {
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            parent: write,
            child: Some(read),
        })
    }

    /// Read end for the monitor. Only the first call returns it.
    pub fn take_child(&mut self) -> io::Result<OwnedFd> {
        take(&mut self.child)
    }

    /// Release the monitor. Closes our end afterwards.
    pub fn send(self, _signal: StartSignal) -> io::Result<()> {
        let written = write(&self.parent, &[StartSignal::BYTE])?;
        if written != 1 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "start signal not written",
            ));
        }
        Ok(())
    }
}

fn take(end: &mut Option<OwnedFd>) -> io::Result<OwnedFd> {
    end.take()
        .ok_or_else(|| io::Error::other("child end of pipe already handed out"))
}
