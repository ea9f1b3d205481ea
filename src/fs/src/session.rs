//! The seam between the transport and the filesystem layer.

use std::fmt;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::BufVec;
use crate::fuse::InHeader;
use crate::reply::ReplyChannel;

/// The filesystem layer: everything above the transport. It receives one
/// parsed request buffer at a time and answers through the reply channel
/// (or not at all, for fire-and-forget requests like FORGET).
pub trait Filesystem: Send + Sync {
    fn process(&self, bufv: &BufVec<'_>, ch: &mut ReplyChannel) -> io::Result<()>;
}

/// Per-mount settings shared by every queue and worker.
pub struct Session {
    fs: Box<dyn Filesystem>,
    buf_size: usize,
    thread_pool_size: usize,
    notify_enabled: AtomicBool,
}

impl Session {
    pub fn new(fs: Box<dyn Filesystem>, buf_size: usize, thread_pool_size: usize) -> Self {
        assert!(buf_size > size_of::<InHeader>());
        assert!(thread_pool_size > 0);
        Session {
            fs,
            buf_size,
            thread_pool_size,
            notify_enabled: AtomicBool::new(false),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
    }

    /// Latched once at feature-negotiation time, read by every
    /// notification send afterwards.
    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled.load(Ordering::Relaxed)
    }

    pub fn set_notify_enabled(&self, enabled: bool) {
        self.notify_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn process(&self, bufv: &BufVec<'_>, ch: &mut ReplyChannel) -> io::Result<()> {
        self.fs.process(bufv, ch)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("buf_size", &self.buf_size)
            .field("thread_pool_size", &self.thread_pool_size)
            .field("notify_enabled", &self.notify_enabled)
            .finish()
    }
}
