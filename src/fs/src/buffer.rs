//! The request buffer vector handed to the filesystem layer.

use std::fmt;

use vm_memory::VolatileSlice;

/// One piece of a request payload.
pub enum Buf<'a> {
    /// Bytes copied out of the guest; stable even if the guest scribbles on
    /// the descriptors afterwards. Headers always arrive this way.
    Mem(&'a [u8]),
    /// A guest segment aliased in place (write payloads on the fast path).
    Guest(VolatileSlice<'a>),
    /// A guest-physical region the hypervisor left unmapped; only reachable
    /// indirectly, via the slave channel's bounce IO.
    Phys { addr: u64, len: u32 },
}

impl<'a> Buf<'a> {
    pub fn len(&self) -> usize {
        match self {
            Buf::Mem(buf) => buf.len(),
            Buf::Guest(slice) => slice.len(),
            Buf::Phys { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Buf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Buf::Mem(buf) => write!(f, "Mem({} bytes)", buf.len()),
            Buf::Guest(slice) => write!(f, "Guest({} bytes)", slice.len()),
            Buf::Phys { addr, len } => write!(f, "Phys({:#x}, {} bytes)", addr, len),
        }
    }
}

/// An ordered request buffer: one copied header entry, optionally followed
/// by aliased payload segments.
#[derive(Debug)]
pub struct BufVec<'a> {
    pub bufs: Vec<Buf<'a>>,
}

impl<'a> BufVec<'a> {
    pub fn size(&self) -> usize {
        self.bufs.iter().map(Buf::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bufvec_size() {
        let head = [0u8; 80];
        let bufv = BufVec {
            bufs: vec![
                Buf::Mem(&head),
                Buf::Phys {
                    addr: 0x8000_0000,
                    len: 4096,
                },
            ],
        };
        assert_eq!(bufv.size(), 80 + 4096);
        assert!(!bufv.bufs[0].is_empty());
    }
}
