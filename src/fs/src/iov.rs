//! Scatter/gather helpers over guest descriptor segments.
//!
//! These are the only routines that touch guest memory for request and
//! reply payloads; everything above them treats segment lists as opaque.
//! The guest owns the underlying pages and may scribble on them at any
//! time, so nothing here trusts previously-read contents.

use std::cmp::min;
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;

use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::hope;

/// One guest-physical segment of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iov {
    pub addr: GuestAddress,
    pub len: u32,
}

pub fn iov_size(iov: &[Iov]) -> usize {
    iov.iter().map(|seg| seg.len as usize).sum()
}

fn mem_err(e: vm_memory::guest_memory::Error) -> io::Error {
    io::Error::new(ErrorKind::Other, e)
}

/// Gather-copy whole segments into a contiguous buffer.
/// The caller must have checked that `dst` has room for `iov_size(iov)`.
pub fn copy_from_iov(mem: &GuestMemoryMmap, dst: &mut [u8], iov: &[Iov]) -> io::Result<usize> {
    let mut off = 0;
    for seg in iov {
        let len = seg.len as usize;
        mem.read_slice(&mut dst[off..off + len], seg.addr)
            .map_err(mem_err)?;
        off += len;
    }
    Ok(off)
}

/// Copy exactly `to_copy` bytes from a list of daemon buffers into guest
/// segments, walking both sides independently. The caller must have checked
/// that both sides hold at least `to_copy` bytes.
pub fn copy_to_iov(
    mem: &GuestMemoryMmap,
    srcs: &[&[u8]],
    dst: &[Iov],
    mut to_copy: usize,
) -> io::Result<()> {
    let mut dst_iter = dst.iter();
    let mut cur = dst_iter.next();
    let mut dst_off = 0usize;

    for src in srcs {
        let mut src = &src[..min(src.len(), to_copy)];
        while !src.is_empty() {
            hope!(cur.is_some());
            let seg = cur.unwrap();
            let space = seg.len as usize - dst_off;
            let len = min(space, src.len());
            mem.write_slice(&src[..len], GuestAddress(seg.addr.0 + dst_off as u64))
                .map_err(mem_err)?;
            src = &src[len..];
            to_copy -= len;
            dst_off += len;
            if dst_off == seg.len as usize {
                cur = dst_iter.next();
                dst_off = 0;
            }
        }
        if to_copy == 0 {
            break;
        }
    }
    hope!(to_copy == 0);
    Ok(())
}

/// A view of `iov` with the first `skip` bytes dropped: whole segments are
/// removed, a straddled segment is advanced in place. The view aliases the
/// same guest memory as the originals.
pub fn skip_iov(iov: &[Iov], mut skip: usize) -> Vec<Iov> {
    let mut out = Vec::with_capacity(iov.len());
    for seg in iov {
        if skip >= seg.len as usize {
            skip -= seg.len as usize;
            continue;
        }
        out.push(Iov {
            addr: GuestAddress(seg.addr.0 + skip as u64),
            len: seg.len - skip as u32,
        });
        skip = 0;
    }
    out
}

/// Cap a view at `limit` bytes, splitting a straddling segment.
pub fn truncate_iov(iov: &[Iov], mut limit: usize) -> Vec<Iov> {
    let mut out = Vec::with_capacity(iov.len());
    for seg in iov {
        if limit == 0 {
            break;
        }
        let take = min(seg.len as usize, limit);
        out.push(Iov {
            addr: seg.addr,
            len: take as u32,
        });
        limit -= take;
    }
    out
}

/// `preadv` from `fd` at `offset` straight into guest segments, without an
/// intermediate copy. Returns the byte count from the kernel (0 means EOF).
pub fn preadv_iov(
    mem: &GuestMemoryMmap,
    fd: RawFd,
    iov: &[Iov],
    offset: u64,
) -> io::Result<usize> {
    let mut slices = Vec::with_capacity(iov.len());
    for seg in iov {
        slices.push(mem.get_slice(seg.addr, seg.len as usize).map_err(mem_err)?);
    }
    let iovecs: Vec<libc::iovec> = slices
        .iter()
        .map(|s| libc::iovec {
            iov_base: s.as_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        })
        .collect();

    // The iovecs point into the mapped guest regions held alive by `mem`.
    let ret = unsafe {
        libc::preadv(
            fd,
            iovecs.as_ptr(),
            iovecs.len() as libc::c_int,
            offset as libc::off_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    use vm_memory::GuestMemoryMmap;

    use super::*;

    fn test_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    #[test]
    fn test_iov_size() {
        let iov = [
            Iov {
                addr: GuestAddress(0x100),
                len: 16,
            },
            Iov {
                addr: GuestAddress(0x200),
                len: 4080,
            },
        ];
        assert_eq!(iov_size(&iov), 4096);
        assert_eq!(iov_size(&[]), 0);
    }

    #[test]
    fn test_gather_copy() {
        let mem = test_mem();
        mem.write_slice(b"hello ", GuestAddress(0x100)).unwrap();
        mem.write_slice(b"world", GuestAddress(0x300)).unwrap();

        let iov = [
            Iov {
                addr: GuestAddress(0x100),
                len: 6,
            },
            Iov {
                addr: GuestAddress(0x300),
                len: 5,
            },
        ];
        let mut buf = [0u8; 11];
        assert_eq!(copy_from_iov(&mem, &mut buf, &iov).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_scatter_copy_across_boundaries() {
        let mem = test_mem();
        let dst = [
            Iov {
                addr: GuestAddress(0x100),
                len: 4,
            },
            Iov {
                addr: GuestAddress(0x200),
                len: 8,
            },
        ];
        // Source slices deliberately misaligned with the segment sizes.
        copy_to_iov(&mem, &[b"abcdef", b"ghijkl"], &dst, 12).unwrap();

        let mut got = [0u8; 4];
        mem.read_slice(&mut got, GuestAddress(0x100)).unwrap();
        assert_eq!(&got, b"abcd");
        let mut got = [0u8; 8];
        mem.read_slice(&mut got, GuestAddress(0x200)).unwrap();
        assert_eq!(&got, b"efghijkl");
    }

    #[test]
    fn test_scatter_copy_stops_at_count() {
        let mem = test_mem();
        mem.write_slice(&[0xee; 8], GuestAddress(0x100)).unwrap();
        let dst = [Iov {
            addr: GuestAddress(0x100),
            len: 8,
        }];
        copy_to_iov(&mem, &[b"abcdefgh"], &dst, 3).unwrap();

        let mut got = [0u8; 8];
        mem.read_slice(&mut got, GuestAddress(0x100)).unwrap();
        assert_eq!(&got, b"abc\xee\xee\xee\xee\xee");
    }

    #[test]
    fn test_skip_whole_and_partial() {
        let iov = [
            Iov {
                addr: GuestAddress(0x100),
                len: 16,
            },
            Iov {
                addr: GuestAddress(0x200),
                len: 32,
            },
            Iov {
                addr: GuestAddress(0x300),
                len: 8,
            },
        ];

        // Drop the first segment and part of the second.
        let view = skip_iov(&iov, 20);
        assert_eq!(
            view,
            vec![
                Iov {
                    addr: GuestAddress(0x204),
                    len: 28
                },
                Iov {
                    addr: GuestAddress(0x300),
                    len: 8
                },
            ]
        );

        // Exactly one segment.
        let view = skip_iov(&iov, 16);
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].addr, GuestAddress(0x200));

        // Everything.
        assert!(skip_iov(&iov, 56).is_empty());
    }

    #[test]
    fn test_truncate() {
        let iov = [
            Iov {
                addr: GuestAddress(0x100),
                len: 16,
            },
            Iov {
                addr: GuestAddress(0x200),
                len: 16,
            },
        ];
        let capped = truncate_iov(&iov, 20);
        assert_eq!(
            capped,
            vec![
                Iov {
                    addr: GuestAddress(0x100),
                    len: 16
                },
                Iov {
                    addr: GuestAddress(0x200),
                    len: 4
                },
            ]
        );
        assert_eq!(iov_size(&truncate_iov(&iov, 100)), 32);
        assert!(truncate_iov(&iov, 0).is_empty());
    }

    #[test]
    fn test_skip_view_aliases_memory() {
        let mem = test_mem();
        let iov = [Iov {
            addr: GuestAddress(0x100),
            len: 8,
        }];
        let view = skip_iov(&iov, 4);
        copy_to_iov(&mem, &[b"wxyz"], &view, 4).unwrap();

        let mut got = [0u8; 8];
        mem.read_slice(&mut got, GuestAddress(0x100)).unwrap();
        assert_eq!(&got[4..], b"wxyz");
    }

    #[test]
    fn test_preadv_into_guest() {
        let mem = test_mem();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();

        let iov = [
            Iov {
                addr: GuestAddress(0x100),
                len: 4,
            },
            Iov {
                addr: GuestAddress(0x200),
                len: 4,
            },
        ];
        let n = preadv_iov(&mem, file.as_raw_fd(), &iov, 2).unwrap();
        assert_eq!(n, 8);

        let mut got = [0u8; 4];
        mem.read_slice(&mut got, GuestAddress(0x100)).unwrap();
        assert_eq!(&got, b"2345");
        mem.read_slice(&mut got, GuestAddress(0x200)).unwrap();
        assert_eq!(&got, b"6789");

        // Past EOF: zero bytes, not an error.
        let n = preadv_iov(&mem, file.as_raw_fd(), &iov, 100).unwrap();
        assert_eq!(n, 0);
    }
}
