//! Per-element task body: validate the request shape, build the buffer
//! vector for the filesystem layer, and make sure the element always goes
//! back to its queue.

use std::io;
use std::mem::size_of;
use std::sync::Arc;

use log::{debug, error};
use vm_memory::GuestMemory;

use crate::buffer::{Buf, BufVec};
use crate::device::Device;
use crate::fuse::{self, InHeader, Opcode, ReadIn, WriteIn};
use crate::hope;
use crate::iov;
use crate::queue::QueueInfo;
use crate::reply::ReplyChannel;

pub fn process_element(dev: &Arc<Device>, qi: &Arc<QueueInfo>, elem: crate::vring::Element) {
    let mut ch = ReplyChannel::new(elem, qi.clone(), dev.clone());
    if let Err(e) = run_request(dev, &mut ch) {
        error!("request on queue {} failed: {}", qi.qidx, e);
    }
    // A request that produced no reply still recycles its element.
    if !ch.reply_sent() {
        ch.finish_empty();
    }
}

pub(crate) fn run_request(dev: &Arc<Device>, ch: &mut ReplyChannel) -> io::Result<()> {
    let session = dev.session().clone();
    let out_sg = ch.elem.out_sg.clone();
    let bad_out = ch.elem.bad_out;
    let bad_in = ch.elem.bad_in;
    let in_num = ch.elem.in_sg.len();
    let head_index = ch.elem.head_index;

    let out_num = out_sg.len();
    let out_num_readable = out_num - bad_out;
    let out_len = iov::iov_size(&out_sg);
    let out_len_readable = iov::iov_size(&out_sg[..out_num_readable]);
    debug!(
        "elem {}: {} readable desc of {} bytes, bad_in={} bad_out={}",
        head_index, out_num, out_len, bad_in, bad_out
    );

    // The element must carry at least a request header and fit the session
    // buffer; a guest violating either gets the process taken down rather
    // than a silently mangled request.
    hope!(out_len_readable >= size_of::<InHeader>());
    hope!(out_len <= session.buf_size());

    // The guest can rewrite descriptors under us at any time, so headers
    // are always copied out before anything looks at them.
    let mut fbuf = vec![0u8; session.buf_size()];
    let mem = dev.memory();

    // First segment only, enough to make the opcode inspectable.
    let first_len = out_sg[0].len as usize;
    iov::copy_from_iov(&mem, &mut fbuf[..first_len], &out_sg[..1])?;
    let opcode = fuse::parse::<InHeader>(&fbuf[..first_len]).and_then(|hdr| Opcode::parse(hdr.opcode));

    let write_fast = out_num > 2
        && out_num_readable >= 2
        && bad_in == 0
        && out_sg[0].len as usize == size_of::<InHeader>()
        && opcode == Some(Opcode::Write)
        && out_sg[1].len as usize == size_of::<WriteIn>();

    if bad_in > 0 || bad_out > 0 {
        let unmappable_read = out_num == 2
            && out_num_readable == 2
            && bad_in > 0
            && out_sg[0].len as usize == size_of::<InHeader>()
            && opcode == Some(Opcode::Read)
            && out_sg[1].len as usize == size_of::<ReadIn>();

        if write_fast {
            debug!(
                "unmappable write case: out {}(bad {})",
                out_num, bad_out
            );
        } else if unmappable_read {
            // Nothing special on the request side; the reply path routes
            // the unmappable writable tail through the slave channel.
            debug!("unmappable read case: in {}(bad {})", in_num, bad_in);
        } else {
            error!(
                "unhandled unmappable element: out: {}(b:{}) in: {}(b:{})",
                out_num, bad_out, in_num, bad_in
            );
            panic!("unhandled unmappable element");
        }
    }

    let mut bufs: Vec<Buf<'_>> = Vec::new();
    if write_fast {
        // A write's payload is used straight out of guest memory, no copy.
        // The two headers still get copied in case the guest was nasty and
        // changed them while we were using them.
        let header_len = size_of::<InHeader>() + size_of::<WriteIn>();
        iov::copy_from_iov(
            &mem,
            &mut fbuf[size_of::<InHeader>()..header_len],
            &out_sg[1..2],
        )?;

        bufs.push(Buf::Mem(&fbuf[..header_len]));
        for (idx, seg) in out_sg.iter().enumerate().skip(2) {
            if idx < out_num_readable {
                let slice = mem
                    .get_slice(seg.addr, seg.len as usize)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                bufs.push(Buf::Guest(slice));
            } else {
                // The hypervisor left this one unmapped; the filesystem
                // layer must route it through slave IO.
                bufs.push(Buf::Phys {
                    addr: seg.addr.0,
                    len: seg.len,
                });
            }
        }
    } else {
        // Normal path: the whole request lands contiguously in our copy.
        let total = iov::copy_from_iov(&mem, &mut fbuf[..out_len], &out_sg)?;
        bufs.push(Buf::Mem(&fbuf[..total]));
    }

    let bufv = BufVec { bufs };
    debug!(
        "elem {}: dispatching {} buffer(s), {} bytes",
        head_index,
        bufv.bufs.len(),
        bufv.size()
    );
    session.process(&bufv, ch)
}
