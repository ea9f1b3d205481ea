//! Shared device state: the queue table, the dispatch reader/writer lock,
//! feature and config negotiation values, and the slave-channel holder.
//!
//! Lock discipline: endpoint callbacks that mutate queue or memory state
//! take `dispatch_lock` exclusively; pumps and workers take it shared
//! around every pop and push/notify. The exclusive side is released while
//! a stopped queue's pump is joined so in-flight workers can still deliver
//! their replies.

use std::fs::File;
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error, info, warn};
use vhost::vhost_user::message::{
    VhostUserFSSlaveMsg, VhostUserProtocolFeatures, VhostUserVirtioFeatures,
};
use vhost::vhost_user::SlaveFsCacheReq;
use virtio_bindings::bindings::virtio_net::VIRTIO_F_VERSION_1;
use vm_memory::{
    ByteValued, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryLoadGuard, GuestMemoryMmap,
};
use vmm_sys_util::eventfd::EventFd;

use crate::fuse::{self, NotifyLockOut, OutHeader};
use crate::hope;
use crate::iov;
use crate::utils::eno;
use crate::queue::{self, QueueHandle, QueueInfo};
use crate::session::Session;
use crate::slave::SlaveChannel;
use crate::vring::Vring;

/// Device feature bit: the guest may use the notification queue.
pub const VIRTIO_FS_F_NOTIFICATION: u64 = 0;

/// Device config space, little-endian on the wire. The queue count belongs
/// to the hypervisor; we fill in the tag and the notification buffer size.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct VirtioFsConfig {
    pub tag: [u8; 36],
    pub num_request_queues: u32,
    pub notify_buf_size: u32,
}

impl Default for VirtioFsConfig {
    fn default() -> Self {
        VirtioFsConfig {
            tag: [0; 36],
            num_request_queues: 0,
            notify_buf_size: 0,
        }
    }
}

unsafe impl ByteValued for VirtioFsConfig {}

pub struct Device {
    session: Arc<Session>,
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
    dispatch_lock: RwLock<()>,
    queues: Mutex<Vec<Option<QueueHandle>>>,
    slave: Mutex<Option<SlaveChannel>>,
    tag: [u8; 36],
    queue_size: u16,
}

impl Device {
    pub fn new(
        session: Arc<Session>,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
        tag: &str,
        queue_size: u16,
    ) -> Arc<Self> {
        let mut tag_bytes = [0u8; 36];
        let raw = tag.as_bytes();
        if raw.len() > tag_bytes.len() {
            warn!("tag {:?} truncated to {} bytes", tag, tag_bytes.len());
        }
        let len = raw.len().min(tag_bytes.len());
        tag_bytes[..len].copy_from_slice(&raw[..len]);

        Arc::new(Device {
            session,
            mem,
            dispatch_lock: RwLock::new(()),
            queues: Mutex::new(Vec::new()),
            slave: Mutex::new(None),
            tag: tag_bytes,
            queue_size,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn guest_memory(&self) -> GuestMemoryAtomic<GuestMemoryMmap> {
        self.mem.clone()
    }

    /// A consistent snapshot of the current guest memory map.
    pub fn memory(&self) -> GuestMemoryLoadGuard<GuestMemoryMmap> {
        self.mem.memory()
    }

    pub fn dispatch_lock(&self) -> &RwLock<()> {
        &self.dispatch_lock
    }

    /// Ring size every queue is created with.
    pub fn queue_size(&self) -> u16 {
        self.queue_size
    }

    pub fn features() -> u64 {
        1u64 << VIRTIO_F_VERSION_1
            | 1u64 << VIRTIO_FS_F_NOTIFICATION
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
    }

    /// CONFIG is the one feature this device adds; the rest is the ambient
    /// protocol plumbing the slave channel and multiqueue setup ride on.
    pub fn protocol_features() -> VhostUserProtocolFeatures {
        VhostUserProtocolFeatures::CONFIG
            | VhostUserProtocolFeatures::MQ
            | VhostUserProtocolFeatures::SLAVE_REQ
            | VhostUserProtocolFeatures::SLAVE_SEND_FD
            | VhostUserProtocolFeatures::REPLY_ACK
    }

    pub fn ack_features(&self, features: u64) {
        if features & (1u64 << VIRTIO_FS_F_NOTIFICATION) != 0 {
            info!("guest acked the notification queue");
            self.session.set_notify_enabled(true);
        }
    }

    pub fn config(&self) -> VirtioFsConfig {
        debug!(
            "config: notify_buf_size={}",
            size_of::<NotifyLockOut>() as u32
        );
        VirtioFsConfig {
            tag: self.tag,
            notify_buf_size: size_of::<NotifyLockOut>() as u32,
            ..Default::default()
        }
    }

    /// Fire up a pump thread for a queue that just started. Queue 0 is
    /// hiprio, queue 1 is the notification queue when enabled, and exactly
    /// one request queue follows; anything else is rejected.
    pub fn start_queue(
        self: &Arc<Self>,
        qidx: u16,
        vring: Arc<Mutex<Vring>>,
        kick: EventFd,
    ) -> io::Result<()> {
        let notify_enabled = self.session.notify_enabled();
        let valid_queues = 2 + usize::from(notify_enabled);
        if usize::from(qidx) >= valid_queues {
            error!(
                "multiple request queues not supported, rejecting queue {}",
                qidx
            );
            return Err(eno(libc::EINVAL));
        }

        let mut queues = self.queues.lock().unwrap();
        if usize::from(qidx) >= queues.len() {
            queues.resize_with(usize::from(qidx) + 1, || None);
        }
        // A started queue must be stopped before it can start again.
        hope!(queues[usize::from(qidx)].is_none());

        let kill = EventFd::new(libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE)?;
        let info = Arc::new(QueueInfo { qidx, vring });
        let notify_pump = notify_enabled && qidx == 1;
        let thread = queue::spawn_pump(
            self.clone(),
            info.clone(),
            kick,
            kill.try_clone()?,
            notify_pump,
        )?;
        info!(
            "queue {} started{}",
            qidx,
            if notify_pump { " (notification)" } else { "" }
        );
        queues[usize::from(qidx)] = Some(QueueHandle { info, kill, thread });
        Ok(())
    }

    /// Tear down a queue's pump: signal the kill eventfd, then join. The
    /// caller must not hold `dispatch_lock` exclusively; in-flight workers
    /// still need the shared side to deliver their replies before the pool
    /// drains.
    pub fn stop_queue(&self, qidx: u16) {
        let handle = {
            let mut queues = self.queues.lock().unwrap();
            match queues.get_mut(usize::from(qidx)) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        let handle = match handle {
            Some(handle) => handle,
            None => {
                debug!("stop for queue {} that never started", qidx);
                return;
            }
        };
        if let Err(e) = handle.kill.write(1) {
            error!("failed to signal queue {} pump: {}", qidx, e);
        }
        if handle.thread.join().is_err() {
            error!("queue {} pump panicked", qidx);
        }
        info!("queue {} stopped", qidx);
    }

    /// Send an unsolicited message (out header `unique == 0`) to the guest
    /// on the notification queue. `EOPNOTSUPP` when notifications were not
    /// negotiated, `ENOSPC` when the queue has no buffer available.
    pub fn send_notification(&self, iov: &[&[u8]]) -> io::Result<()> {
        hope!(!iov.is_empty());
        hope!(iov[0].len() >= size_of::<OutHeader>());
        let mut out: OutHeader = fuse::parse(iov[0]).unwrap();
        hope!(out.unique == 0);

        if !self.session.notify_enabled() {
            return Err(eno(libc::EOPNOTSUPP));
        }

        // Queue index 1 is the notification queue when enabled.
        let qi = {
            let queues = self.queues.lock().unwrap();
            match queues.get(1).and_then(|slot| slot.as_ref()) {
                Some(handle) => handle.info.clone(),
                None => return Err(eno(libc::ENOSPC)),
            }
        };

        let elem = {
            let _dispatch = self.dispatch_lock.read().unwrap();
            let mut vring = qi.vring.lock().unwrap();
            vring.pop()
        };
        let elem = match elem {
            Some(elem) => elem,
            // No buffer queued by the guest; the caller may drop the
            // notification or retry later.
            None => return Err(eno(libc::ENOSPC)),
        };

        let tosend_len: usize = iov.iter().map(|buf| buf.len()).sum();
        out.len = tosend_len as u32;
        let in_len = iov::iov_size(&elem.in_sg);
        debug!(
            "notification: elem {}: {} writable bytes, sending {}",
            elem.head_index, in_len, tosend_len
        );

        let push = |len: u32| -> io::Result<()> {
            let _dispatch = self.dispatch_lock.read().unwrap();
            let mut vring = qi.vring.lock().unwrap();
            vring.push(elem.head_index, len)?;
            vring.signal()
        };

        if in_len < size_of::<OutHeader>() || in_len < tosend_len {
            error!(
                "notification elem {} too small for {} bytes",
                elem.head_index, tosend_len
            );
            // Still recycle the element; dropping it would leak a
            // descriptor the guest never gets back.
            let _ = push(0);
            return Err(eno(libc::E2BIG));
        }

        let copied = {
            let mem = self.memory();
            let mut srcs: Vec<&[u8]> = Vec::with_capacity(iov.len() + 1);
            srcs.push(out.as_slice());
            srcs.push(&iov[0][size_of::<OutHeader>()..]);
            srcs.extend_from_slice(&iov[1..]);
            iov::copy_to_iov(&mem, &srcs, &elem.in_sg, tosend_len)
        };
        if let Err(e) = copied {
            let _ = push(0);
            return Err(e);
        }

        push(tosend_len as u32)
    }

    pub fn set_slave_channel(&self, req: SlaveFsCacheReq) {
        info!("slave channel connected");
        *self.slave.lock().unwrap() = Some(SlaveChannel::new(req));
    }

    fn with_slave<F: FnOnce(&SlaveChannel) -> i64>(&self, f: F) -> i64 {
        match &*self.slave.lock().unwrap() {
            Some(channel) => f(channel),
            None => -i64::from(libc::ENODEV),
        }
    }

    /// Map file ranges into the DAX cache window.
    pub fn cache_map(&self, msg: &VhostUserFSSlaveMsg, fd: &dyn AsRawFd) -> i64 {
        self.with_slave(|ch| ch.map(msg, fd))
    }

    /// Drop cache-window ranges.
    pub fn cache_unmap(&self, msg: &VhostUserFSSlaveMsg) -> i64 {
        self.with_slave(|ch| ch.unmap(msg))
    }

    /// msync cache-window ranges.
    pub fn cache_sync(&self, msg: &VhostUserFSSlaveMsg) -> i64 {
        self.with_slave(|ch| ch.sync(msg))
    }

    /// Raw bounce IO between a file and guest-physical memory.
    pub fn cache_io(&self, msg: &VhostUserFSSlaveMsg, fd: &dyn AsRawFd) -> i64 {
        self.with_slave(|ch| ch.io(msg, fd))
    }

    pub(crate) fn slave_read_to_guest(
        &self,
        src: &File,
        src_offset: u64,
        dst_addr: u64,
        len: u64,
    ) -> i64 {
        self.with_slave(|ch| ch.read_to_guest(src, src_offset, dst_addr, len))
    }

    /// Write from an unmappable guest region to a file at an explicit
    /// offset, bounced through the hypervisor.
    pub fn write_from_guest(&self, dst: &File, dst_offset: u64, src_addr: u64, len: u64) -> i64 {
        self.with_slave(|ch| ch.write_from_guest(dst, dst_offset, src_addr, len))
    }

    #[cfg(test)]
    pub(crate) fn started_queues(&self) -> usize {
        self.queues
            .lock()
            .unwrap()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("session", &self.session)
            .finish()
    }
}
