//! Typed wrapper over the master-to-slave request channel.
//!
//! The hypervisor owns the DAX cache window and the guest-physical memory
//! map; this channel is how we ask it to mmap file ranges into the window,
//! drop them again, msync them, or move bytes between a file and guest RAM
//! we cannot see (bounce IO for unmappable descriptor segments).
//!
//! Every call returns a single signed result: non-negative on success
//! (bytes transferred for IO requests, 0 otherwise), `-errno` on failure.
//! An IO request returning 0 means EOF and callers must stop looping on
//! that region.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use log::debug;
use vhost::vhost_user::message::{
    VhostUserFSSlaveMsg, VhostUserFSSlaveMsgFlags, VHOST_USER_FS_SLAVE_ENTRIES,
};
use vhost::vhost_user::{SlaveFsCacheReq, VhostUserMasterReqHandler};

/// Entry length meaning "the whole cache window" in an unmap request.
pub const UNMAP_ALL: u64 = !0u64;

pub struct SlaveChannel {
    req: SlaveFsCacheReq,
}

impl SlaveChannel {
    pub fn new(req: SlaveFsCacheReq) -> Self {
        SlaveChannel { req }
    }

    /// Ask the hypervisor to mmap ranges of `fd` into the cache window.
    pub fn map(&self, msg: &VhostUserFSSlaveMsg, fd: &dyn AsRawFd) -> i64 {
        result(self.req.fs_slave_map(msg, fd))
    }

    /// Replace cache-window ranges with anonymous, inaccessible pages.
    pub fn unmap(&self, msg: &VhostUserFSSlaveMsg) -> i64 {
        result(self.req.fs_slave_unmap(msg))
    }

    /// msync cache-window ranges.
    pub fn sync(&self, msg: &VhostUserFSSlaveMsg) -> i64 {
        result(self.req.fs_slave_sync(msg))
    }

    /// Bounce IO between `fd` and guest RAM addressed physically. The
    /// hypervisor closes its copy of the fd after servicing the request.
    pub fn io(&self, msg: &VhostUserFSSlaveMsg, fd: &dyn AsRawFd) -> i64 {
        result(self.req.fs_slave_io(msg, fd))
    }

    /// Fill guest RAM at physical address `dst_addr` from `src` at
    /// `src_offset` (serving a guest read of an unmappable segment).
    pub fn read_to_guest(&self, src: &File, src_offset: u64, dst_addr: u64, len: u64) -> i64 {
        let msg = io_entry(VhostUserFSSlaveMsgFlags::MAP_R, src_offset, dst_addr, len);
        let ret = self.io(&msg, src);
        debug!(
            "slave io read: fd_offset={} gpa={:#x} len={} ret={}",
            src_offset, dst_addr, len, ret
        );
        ret
    }

    /// Write guest RAM at physical address `src_addr` out to `dst` at
    /// `dst_offset` (serving a guest write from an unmappable segment).
    /// The destination offset is explicit; there is no current-position
    /// fallback, which would race concurrent writers on the same fd.
    pub fn write_from_guest(&self, dst: &File, dst_offset: u64, src_addr: u64, len: u64) -> i64 {
        let msg = io_entry(VhostUserFSSlaveMsgFlags::MAP_W, dst_offset, src_addr, len);
        let ret = self.io(&msg, dst);
        debug!(
            "slave io write: fd_offset={} gpa={:#x} len={} ret={}",
            dst_offset, src_addr, len, ret
        );
        ret
    }
}

impl std::fmt::Debug for SlaveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveChannel").finish()
    }
}

fn result(res: std::io::Result<u64>) -> i64 {
    match res {
        Ok(n) => n as i64,
        Err(e) => -i64::from(e.raw_os_error().unwrap_or(libc::EIO)),
    }
}

/// A single-entry message for one mapping or IO region.
pub fn entry(
    flags: VhostUserFSSlaveMsgFlags,
    fd_offset: u64,
    cache_offset: u64,
    len: u64,
) -> VhostUserFSSlaveMsg {
    let mut msg = VhostUserFSSlaveMsg::default();
    msg.flags[0] = flags;
    msg.fd_offset[0] = fd_offset;
    msg.cache_offset[0] = cache_offset;
    msg.len[0] = len;
    msg
}

/// For IO requests the cache-offset slot carries a guest physical address.
fn io_entry(
    flags: VhostUserFSSlaveMsgFlags,
    fd_offset: u64,
    guest_addr: u64,
    len: u64,
) -> VhostUserFSSlaveMsg {
    entry(flags, fd_offset, guest_addr, len)
}

/// An unmap request covering the whole cache window.
pub fn unmap_all() -> VhostUserFSSlaveMsg {
    let mut msg = VhostUserFSSlaveMsg::default();
    msg.len[0] = UNMAP_ALL;
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let msg = entry(VhostUserFSSlaveMsgFlags::MAP_W, 0x1000, 0x8000_0000, 512);
        assert_eq!(msg.flags[0], VhostUserFSSlaveMsgFlags::MAP_W);
        assert_eq!(msg.fd_offset[0], 0x1000);
        assert_eq!(msg.cache_offset[0], 0x8000_0000);
        assert_eq!(msg.len[0], 512);
        for i in 1..VHOST_USER_FS_SLAVE_ENTRIES {
            assert_eq!(msg.len[i], 0);
        }
    }

    #[test]
    fn test_unmap_all_sentinel() {
        let msg = unmap_all();
        assert_eq!(msg.len[0], UNMAP_ALL);
        assert_eq!(msg.flags[0], VhostUserFSSlaveMsgFlags::default());
    }
}
