//! Small helpers for the transport's trust boundaries.

use std::io;

// Assert about state the guest or the device master owes us (descriptor
// shapes, negotiated features, channel ordering) - greppable separately
// from plain assertions about our own invariants.
#[macro_export]
macro_rules! hope {
    ($cond:expr) => {
        assert!($cond, "guest or device master broke the virtio-fs contract");
    };
}

/// An errno-carrying error, the shape FUSE replies and the slave channel
/// traffic in.
pub(crate) fn eno(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}
