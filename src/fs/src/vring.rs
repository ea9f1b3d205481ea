//! Wrapper around one split virtqueue: configuration from the protocol
//! endpoint on one side, element pop/push/signal for the pumps and workers
//! on the other. All access is serialized by the `Mutex` this lives in.

use std::num::Wrapping;
use std::ops::Deref;

use log::{debug, error};
use virtio_queue::{DescriptorChain, Queue};
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use crate::iov::Iov;

/// A popped descriptor chain, reduced to the segment lists the transport
/// works with. `in_sg` is writable by us (the reply path), `out_sg` is
/// readable (the request). `bad_in`/`bad_out` count trailing segments the
/// hypervisor deliberately did not map into our address space; those are
/// guest-physical regions only reachable through the slave channel.
#[derive(Debug, Clone)]
pub struct Element {
    pub head_index: u16,
    pub in_sg: Vec<Iov>,
    pub out_sg: Vec<Iov>,
    pub bad_in: usize,
    pub bad_out: usize,
}

impl Element {
    fn from_chain<M>(chain: DescriptorChain<M>) -> Self
    where
        M: Clone + Deref,
        M::Target: GuestMemory + Sized,
    {
        let head_index = chain.head_index();
        let out_sg: Vec<Iov> = chain
            .clone()
            .readable()
            .map(|desc| Iov {
                addr: desc.addr(),
                len: desc.len(),
            })
            .collect();
        let in_sg: Vec<Iov> = chain
            .clone()
            .writable()
            .map(|desc| Iov {
                addr: desc.addr(),
                len: desc.len(),
            })
            .collect();

        let mem = chain.memory();
        let bad_out = trailing_unmappable(mem, &out_sg);
        let bad_in = trailing_unmappable(mem, &in_sg);

        Element {
            head_index,
            in_sg,
            out_sg,
            bad_in,
            bad_out,
        }
    }
}

/// Count the run of segments at the tail of `sg` that cannot be resolved in
/// our address space. The hypervisor places unmappable regions last in each
/// direction; anything unmappable elsewhere surfaces later as a copy error.
fn trailing_unmappable<M: GuestMemory>(mem: &M, sg: &[Iov]) -> usize {
    sg.iter()
        .rev()
        .take_while(|seg| mem.get_slice(seg.addr, seg.len as usize).is_err())
        .count()
}

pub struct Vring {
    queue: Queue<GuestMemoryAtomic<GuestMemoryMmap>>,
    kick: Option<EventFd>,
    call: Option<EventFd>,
    err: Option<EventFd>,
    enabled: bool,
}

impl Vring {
    pub fn new(mem: GuestMemoryAtomic<GuestMemoryMmap>, max_size: u16) -> Self {
        Vring {
            queue: Queue::new(mem, max_size),
            kick: None,
            call: None,
            err: None,
            enabled: false,
        }
    }

    pub fn set_size(&mut self, size: u16) {
        self.queue.state.size = size;
    }

    pub fn set_addresses(&mut self, desc_table: GuestAddress, avail: GuestAddress, used: GuestAddress) {
        self.queue.state.desc_table = desc_table;
        self.queue.state.avail_ring = avail;
        self.queue.state.used_ring = used;
    }

    pub fn set_base(&mut self, base: u16) {
        self.queue.state.next_avail = Wrapping(base);
        self.queue.state.next_used = Wrapping(base);
    }

    pub fn base(&self) -> u16 {
        self.queue.state.next_avail.0
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.queue.state.ready = ready;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_kick(&mut self, kick: Option<EventFd>) {
        self.kick = kick;
    }

    /// A dup of the kick eventfd for a pump thread to wait on.
    pub fn kick_clone(&self) -> Option<EventFd> {
        self.kick.as_ref().and_then(|fd| fd.try_clone().ok())
    }

    pub fn set_call(&mut self, call: Option<EventFd>) {
        self.call = call;
    }

    pub fn set_err(&mut self, err: Option<EventFd>) {
        self.err = err;
    }

    /// Pop one available element, with its unmappable tails classified.
    pub fn pop(&mut self) -> Option<Element> {
        if !self.enabled || !self.queue.state.ready {
            return None;
        }
        let mut iter = match self.queue.iter() {
            Ok(iter) => iter,
            Err(e) => {
                error!("failed to iterate queue: {}", e);
                return None;
            }
        };
        let elem = iter.next().map(Element::from_chain)?;
        debug!(
            "popped elem {}: out {}(bad {}) in {}(bad {})",
            elem.head_index,
            elem.out_sg.len(),
            elem.bad_out,
            elem.in_sg.len(),
            elem.bad_in
        );
        Some(elem)
    }

    /// Return an element to the used ring with the number of bytes written
    /// into its writable segments.
    pub fn push(&mut self, head_index: u16, len: u32) -> std::io::Result<()> {
        self.queue
            .add_used(head_index, len)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    /// Ring the guest's doorbell unless notification suppression applies.
    pub fn signal(&mut self) -> std::io::Result<()> {
        let needed = self
            .queue
            .needs_notification()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        if needed {
            if let Some(call) = &self.call {
                call.write(1)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Vring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vring")
            .field("enabled", &self.enabled)
            .field("kick", &self.kick)
            .field("call", &self.call)
            .field("err", &self.err)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use vm_memory::GuestMemoryMmap;

    use super::*;

    #[test]
    fn test_trailing_unmappable() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();

        let mapped = Iov {
            addr: GuestAddress(0x1000),
            len: 4096,
        };
        let unmapped = Iov {
            addr: GuestAddress(0x8000_0000),
            len: 4096,
        };

        assert_eq!(trailing_unmappable(&mem, &[mapped, mapped]), 0);
        assert_eq!(trailing_unmappable(&mem, &[mapped, unmapped]), 1);
        assert_eq!(trailing_unmappable(&mem, &[mapped, unmapped, unmapped]), 2);
        // An unmappable segment before a mappable one is not part of the
        // trailing run.
        assert_eq!(trailing_unmappable(&mem, &[unmapped, mapped]), 0);
        assert_eq!(trailing_unmappable(&mem, &[]), 0);
    }
}
