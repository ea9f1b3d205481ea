//! The reply side of one in-flight request.
//!
//! A `ReplyChannel` ties a FUSE request to the element it was popped from.
//! Exactly one of `send_reply`/`send_data` may fire per channel; if neither
//! does, the worker returns the element empty so the guest always gets its
//! descriptors back.

use std::cmp::min;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use log::{debug, error};
use vm_memory::{ByteValued, Bytes};

use crate::device::Device;
use crate::fuse::{self, OutHeader};
use crate::hope;
use crate::iov;
use crate::queue::QueueInfo;
use crate::utils::eno;
use crate::vring::Element;

pub struct ReplyChannel {
    pub(crate) elem: Element,
    qi: Arc<QueueInfo>,
    dev: Arc<Device>,
    reply_sent: bool,
}

impl ReplyChannel {
    pub(crate) fn new(elem: Element, qi: Arc<QueueInfo>, dev: Arc<Device>) -> Self {
        ReplyChannel {
            elem,
            qi,
            dev,
            reply_sent: false,
        }
    }

    pub fn reply_sent(&self) -> bool {
        self.reply_sent
    }

    /// Copy a fully-assembled reply into the element's writable segments
    /// and hand it back to the guest. The first entry of `iov` starts with
    /// the out header; `unique == 0` means this is an unsolicited
    /// notification and is routed to the notification queue instead.
    pub fn send_reply(&mut self, iov: &[&[u8]]) -> io::Result<()> {
        hope!(!iov.is_empty());
        hope!(iov[0].len() >= size_of::<OutHeader>());
        let out: OutHeader = fuse::parse(iov[0]).unwrap();

        if out.unique == 0 {
            return self.dev.send_notification(iov);
        }
        hope!(!self.reply_sent);

        let tosend_len: usize = iov.iter().map(|buf| buf.len()).sum();
        let in_len = iov::iov_size(&self.elem.in_sg);
        debug!(
            "send_reply: elem {}: {} writable bytes, reply {}",
            self.elem.head_index, in_len, tosend_len
        );

        if in_len < size_of::<OutHeader>() {
            error!("elem {}: too short for out header", self.elem.head_index);
            return Err(eno(libc::E2BIG));
        }
        if in_len < tosend_len {
            error!(
                "elem {}: too small for reply of {} bytes",
                self.elem.head_index, tosend_len
            );
            return Err(eno(libc::E2BIG));
        }

        {
            let mem = self.dev.memory();
            iov::copy_to_iov(&mem, iov, &self.elem.in_sg, tosend_len)?;
        }

        self.push_and_notify(tosend_len as u32)?;
        self.reply_sent = true;
        Ok(())
    }

    /// Reply whose body is streamed from a file region straight into the
    /// element's writable segments: `iov` carries the headers (out header
    /// first), then `len` bytes are read from `src` at `src_pos`. Short
    /// files are allowed; on EOF the length already written into the guest
    /// header is patched down to what was actually delivered. Unmappable
    /// trailing segments are filled by the hypervisor via slave IO.
    pub fn send_data(
        &mut self,
        iov: &[&[u8]],
        src: &File,
        mut src_pos: u64,
        len: usize,
    ) -> io::Result<()> {
        hope!(!iov.is_empty());
        hope!(iov[0].len() >= size_of::<OutHeader>());
        let mut out: OutHeader = fuse::parse(iov[0]).unwrap();

        // unique == 0 is a notification, which never streams file data
        hope!(out.unique != 0);
        hope!(!self.reply_sent);

        let iov_len: usize = iov.iter().map(|buf| buf.len()).sum();
        let mut tosend_len = iov_len + len;
        out.len = tosend_len as u32;

        let in_sg = &self.elem.in_sg;
        let in_num = in_sg.len();
        let bad_in = self.elem.bad_in;
        let in_len = iov::iov_size(in_sg);
        let in_len_writable = iov::iov_size(&in_sg[..in_num - bad_in]);
        debug!(
            "send_data: elem {}: {} writable ({} mappable), headers {}, data {}",
            self.elem.head_index, in_len, in_len_writable, iov_len, len
        );

        if in_len_writable < size_of::<OutHeader>() {
            error!("elem {}: too short for out header", self.elem.head_index);
            return Err(eno(libc::E2BIG));
        }
        if in_len < tosend_len {
            error!(
                "elem {}: too small for data len {}",
                self.elem.head_index, tosend_len
            );
            return Err(eno(libc::E2BIG));
        }

        let mut remaining = len;
        {
            let mem = self.dev.memory();

            // Headers first, with the patched length.
            let mut srcs: Vec<&[u8]> = Vec::with_capacity(iov.len() + 1);
            srcs.push(out.as_slice());
            srcs.push(&iov[0][size_of::<OutHeader>()..]);
            srcs.extend_from_slice(&iov[1..]);
            iov::copy_to_iov(&mem, &srcs, in_sg, iov_len)?;

            // Stream into the mappable remainder, capped at the requested
            // length so a roomy writable side cannot over-read the file.
            let mut view = iov::truncate_iov(
                &iov::skip_iov(&in_sg[..in_num - bad_in], iov_len),
                remaining,
            );
            while remaining > 0 && !view.is_empty() {
                let got = iov::preadv_iov(&mem, src.as_raw_fd(), &view, src_pos)?;
                debug!("send_data: read {} of {} remaining", got, remaining);
                if got == 0 {
                    break;
                }
                src_pos += got as u64;
                remaining -= got;
                view = iov::skip_iov(&view, got);
            }
        }

        // The unmappable tail is the hypervisor's job.
        if bad_in > 0 && remaining > 0 {
            for seg in &in_sg[in_num - bad_in..] {
                if remaining == 0 {
                    break;
                }
                let this_len = min(u64::from(seg.len), remaining as u64);
                let ret = self
                    .dev
                    .slave_read_to_guest(src, src_pos, seg.addr.0, this_len);
                if ret > 0 {
                    remaining -= this_len as usize;
                    src_pos += this_len;
                } else if ret == 0 {
                    break;
                } else {
                    return Err(eno(-ret as i32));
                }
            }
        }

        // Hit EOF: fix up the length the guest will read from its copy of
        // the header.
        if remaining > 0 {
            tosend_len -= remaining;
            let mem = self.dev.memory();
            mem.write_obj(tosend_len as u32, in_sg[0].addr)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }

        self.push_and_notify(tosend_len as u32)?;
        self.reply_sent = true;
        Ok(())
    }

    /// Recycle the element without a reply. Used by the worker when the
    /// request produced none; every popped element goes back exactly once.
    pub(crate) fn finish_empty(&mut self) {
        debug!("elem {}: no reply sent", self.elem.head_index);
        if let Err(e) = self.push_and_notify(0) {
            error!(
                "failed to return elem {} to its queue: {}",
                self.elem.head_index, e
            );
        }
        self.reply_sent = true;
    }

    fn push_and_notify(&self, len: u32) -> io::Result<()> {
        let _dispatch = self.dev.dispatch_lock().read().unwrap();
        let mut vring = self.qi.vring.lock().unwrap();
        vring.push(self.elem.head_index, len)?;
        vring.signal()
    }
}

impl std::fmt::Debug for ReplyChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyChannel")
            .field("elem", &self.elem)
            .field("reply_sent", &self.reply_sent)
            .finish()
    }
}
