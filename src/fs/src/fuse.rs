//! The slice of the FUSE wire format the transport needs to look at.
//!
//! The transport never interprets request bodies; it only needs the fixed
//! headers to route replies, spot the write/read fast paths, and size the
//! notification buffer advertised in the device config.

use std::convert::TryFrom;
use std::mem::size_of;

use num_enum::TryFromPrimitive;
use vm_memory::ByteValued;

// Message definitions are POD types, so ByteValued is safe for all of them.

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}
unsafe impl ByteValued for InHeader {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}
unsafe impl ByteValued for OutHeader {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for ReadIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}
unsafe impl ByteValued for WriteIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}
unsafe impl ByteValued for WriteOut {}

/// Body of an unsolicited lock-wakeup notification. Its size is what the
/// device config reports as `notify_buf_size`; bump it if larger
/// notification types are ever sent.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NotifyLockOut {
    pub unique: u64,
    pub error: i32,
    pub padding: u32,
    pub lock_owner: u64,
}
unsafe impl ByteValued for NotifyLockOut {}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    Getattr = 3,
    Setattr = 4,
    Readlink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    Statfs = 17,
    Release = 18,
    Fsync = 20,
    Setxattr = 21,
    Getxattr = 22,
    Listxattr = 23,
    Removexattr = 24,
    Flush = 25,
    Init = 26,
    Opendir = 27,
    Readdir = 28,
    Releasedir = 29,
    Fsyncdir = 30,
    Getlk = 31,
    Setlk = 32,
    Setlkw = 33,
    Access = 34,
    Create = 35,
    Interrupt = 36,
    Bmap = 37,
    Destroy = 38,
    Ioctl = 39,
    Poll = 40,
    NotifyReply = 41,
    BatchForget = 42,
    Fallocate = 43,
    Readdirplus = 44,
    Rename2 = 45,
    Lseek = 46,
    CopyFileRange = 47,
}

impl Opcode {
    /// Parse a raw opcode; unknown values come back as `None` rather than
    /// being folded into a catch-all.
    pub fn parse(raw: u32) -> Option<Self> {
        Self::try_from(raw).ok()
    }
}

/// Copy a header out of an unaligned byte buffer. Returns `None` if the
/// buffer is too short.
pub fn parse<T: ByteValued + Default>(buf: &[u8]) -> Option<T> {
    if buf.len() < size_of::<T>() {
        return None;
    }
    let mut val = T::default();
    val.as_mut_slice().copy_from_slice(&buf[..size_of::<T>()]);
    Some(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(size_of::<InHeader>(), 40);
        assert_eq!(size_of::<OutHeader>(), 16);
        assert_eq!(size_of::<ReadIn>(), 40);
        assert_eq!(size_of::<WriteIn>(), 40);
        assert_eq!(size_of::<WriteOut>(), 8);
        assert_eq!(size_of::<NotifyLockOut>(), 24);
    }

    #[test]
    fn test_opcode_parse() {
        assert_eq!(Opcode::parse(15), Some(Opcode::Read));
        assert_eq!(Opcode::parse(16), Some(Opcode::Write));
        assert_eq!(Opcode::parse(26), Some(Opcode::Init));
        assert_eq!(Opcode::parse(0), None);
        assert_eq!(Opcode::parse(7), None);
        assert_eq!(Opcode::parse(0xdead), None);
    }

    #[test]
    fn test_parse_unaligned() {
        let mut buf = vec![0u8; size_of::<InHeader>() + 1];
        let hdr = InHeader {
            len: 40,
            opcode: 16,
            unique: 0x1122_3344_5566_7788,
            ..Default::default()
        };
        buf[1..].copy_from_slice(hdr.as_slice());

        // Deliberately odd offset; parse must not rely on alignment.
        let parsed: InHeader = parse(&buf[1..]).unwrap();
        assert_eq!(parsed.opcode, 16);
        assert_eq!(parsed.unique, 0x1122_3344_5566_7788);

        let short: Option<InHeader> = parse(&buf[..10]);
        assert!(short.is_none());
    }
}
