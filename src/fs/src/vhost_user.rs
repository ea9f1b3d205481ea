//! Glue between the vhost-user protocol endpoint and the device core:
//! the slave-side request handler, socket-path locking, the single accept,
//! and the control-plane dispatch loop.
//!
//! The handler callbacks that mutate queue or memory state take the
//! device's dispatch lock exclusively for the duration of the mutation.
//! The exclusive hold is dropped around a stopped queue's pump join so
//! workers still in flight can take the shared side to deliver replies.

use std::cmp::min;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};

use epoll::{ControlOptions, Event, Events};
use log::{debug, error, info, warn};
use vhost::vhost_user::message::{
    VhostUserConfigFlags, VhostUserInflight, VhostUserMemoryRegion, VhostUserProtocolFeatures,
    VhostUserSingleMemoryRegion, VhostUserVirtioFeatures, VhostUserVringAddrFlags,
    VhostUserVringState,
};
use vhost::vhost_user::{
    Error as VhostError, Listener, Result as VhostResult, SlaveFsCacheReq, SlaveListener,
    SlaveReqHandler, VhostUserSlaveReqHandlerMut,
};
use vm_memory::{
    ByteValued, FileOffset, GuestAddress, GuestMemoryAtomic, GuestMemoryMmap, GuestRegionMmap,
    MmapRegion,
};
use vmm_sys_util::eventfd::EventFd;

use crate::device::Device;
use crate::vring::Vring;

/// One hiprio queue, one notification queue, one request queue.
pub const NUM_QUEUES: usize = 3;

/// Where socket-path pidfiles live.
pub const DEFAULT_STATE_DIR: &str = "/var/run/virtiofsd";

/// One VMM-virtual to guest-physical window from the memory table; ring
/// addresses arrive as VMM virtual addresses and must be translated.
#[derive(Debug, Clone, Copy)]
struct AddrMapping {
    vmm_addr: u64,
    gpa: u64,
    size: u64,
}

pub struct VhostUserFsHandler {
    device: Arc<Device>,
    vrings: Vec<Arc<Mutex<Vring>>>,
    atomic_mem: GuestMemoryAtomic<GuestMemoryMmap>,
    mappings: Vec<AddrMapping>,
    owned: bool,
    acked_features: u64,
    acked_protocol_features: u64,
}

impl VhostUserFsHandler {
    pub fn new(device: Arc<Device>) -> Self {
        let atomic_mem = device.guest_memory();
        let queue_size = device.queue_size();
        let vrings = (0..NUM_QUEUES)
            .map(|_| Arc::new(Mutex::new(Vring::new(atomic_mem.clone(), queue_size))))
            .collect();
        VhostUserFsHandler {
            device,
            vrings,
            atomic_mem,
            mappings: Vec::new(),
            owned: false,
            acked_features: 0,
            acked_protocol_features: 0,
        }
    }

    fn vmm_va_to_gpa(&self, vmm_va: u64) -> VhostResult<u64> {
        for mapping in &self.mappings {
            if vmm_va >= mapping.vmm_addr && vmm_va - mapping.vmm_addr < mapping.size {
                return Ok(vmm_va - mapping.vmm_addr + mapping.gpa);
            }
        }
        error!("ring address {:#x} not covered by the memory table", vmm_va);
        Err(VhostError::InvalidParam)
    }

    fn vring(&self, index: usize) -> VhostResult<&Arc<Mutex<Vring>>> {
        self.vrings.get(index).ok_or(VhostError::InvalidParam)
    }
}

impl VhostUserSlaveReqHandlerMut for VhostUserFsHandler {
    fn set_owner(&mut self) -> VhostResult<()> {
        if self.owned {
            return Err(VhostError::InvalidOperation);
        }
        self.owned = true;
        Ok(())
    }

    fn reset_owner(&mut self) -> VhostResult<()> {
        self.owned = false;
        self.acked_features = 0;
        self.acked_protocol_features = 0;
        Ok(())
    }

    fn get_features(&mut self) -> VhostResult<u64> {
        Ok(Device::features())
    }

    fn set_features(&mut self, features: u64) -> VhostResult<()> {
        if !self.owned {
            return Err(VhostError::InvalidOperation);
        }
        if features & !Device::features() != 0 {
            return Err(VhostError::InvalidParam);
        }
        info!("features acked: {:#x}", features);
        self.acked_features = features;
        self.device.ack_features(features);

        // Without PROTOCOL_FEATURES negotiated, rings start out enabled;
        // with it, they wait for SET_VRING_ENABLE.
        let enabled = self.acked_features & VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits() == 0;
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        for vring in &self.vrings {
            vring.lock().unwrap().set_enabled(enabled);
        }
        Ok(())
    }

    fn set_mem_table(
        &mut self,
        ctx: &[VhostUserMemoryRegion],
        files: Vec<File>,
    ) -> VhostResult<()> {
        if ctx.len() != files.len() {
            return Err(VhostError::InvalidParam);
        }

        let mut regions = Vec::with_capacity(ctx.len());
        let mut mappings = Vec::with_capacity(ctx.len());
        for (region, file) in ctx.iter().zip(files.into_iter()) {
            let mmap = MmapRegion::from_file(
                FileOffset::new(file, region.mmap_offset),
                region.memory_size as usize,
            )
            .map_err(|e| {
                error!("failed to map guest region: {}", e);
                VhostError::InvalidParam
            })?;
            regions.push(
                GuestRegionMmap::new(mmap, GuestAddress(region.guest_phys_addr)).map_err(|e| {
                    error!("bad guest region: {}", e);
                    VhostError::InvalidParam
                })?,
            );
            mappings.push(AddrMapping {
                vmm_addr: region.user_addr,
                gpa: region.guest_phys_addr,
                size: region.memory_size,
            });
        }
        let mem = GuestMemoryMmap::from_regions(regions).map_err(|e| {
            error!("failed to build guest memory: {}", e);
            VhostError::InvalidParam
        })?;
        info!("memory table set: {} region(s)", mappings.len());

        let _dispatch = self.device.dispatch_lock().write().unwrap();
        self.atomic_mem.lock().unwrap().replace(mem);
        self.mappings = mappings;
        Ok(())
    }

    fn set_vring_num(&mut self, index: u32, num: u32) -> VhostResult<()> {
        if num == 0 || num > u32::from(self.device.queue_size()) {
            return Err(VhostError::InvalidParam);
        }
        let vring = self.vring(index as usize)?;
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        vring.lock().unwrap().set_size(num as u16);
        Ok(())
    }

    fn set_vring_addr(
        &mut self,
        index: u32,
        _flags: VhostUserVringAddrFlags,
        descriptor: u64,
        used: u64,
        available: u64,
        _log: u64,
    ) -> VhostResult<()> {
        let desc_table = self.vmm_va_to_gpa(descriptor)?;
        let avail_ring = self.vmm_va_to_gpa(available)?;
        let used_ring = self.vmm_va_to_gpa(used)?;
        debug!(
            "queue {} rings: desc {:#x} avail {:#x} used {:#x}",
            index, desc_table, avail_ring, used_ring
        );
        let vring = self.vring(index as usize)?;
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        vring.lock().unwrap().set_addresses(
            GuestAddress(desc_table),
            GuestAddress(avail_ring),
            GuestAddress(used_ring),
        );
        Ok(())
    }

    fn set_vring_base(&mut self, index: u32, base: u32) -> VhostResult<()> {
        let vring = self.vring(index as usize)?;
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        vring.lock().unwrap().set_base(base as u16);
        Ok(())
    }

    /// Per the protocol this also stops the ring: quiesce the pump and the
    /// workers, then report where the queue got to.
    fn get_vring_base(&mut self, index: u32) -> VhostResult<VhostUserVringState> {
        let vring = self.vring(index as usize)?.clone();
        info!("queue {} stopping", index);
        {
            let _dispatch = self.device.dispatch_lock().write().unwrap();
            vring.lock().unwrap().set_ready(false);
        }

        // Join outside the exclusive lock: in-flight workers take the
        // shared side to push their replies before the pool drains.
        self.device.stop_queue(index as u16);

        let base = {
            let _dispatch = self.device.dispatch_lock().write().unwrap();
            let mut vring = vring.lock().unwrap();
            vring.set_kick(None);
            vring.base()
        };
        Ok(VhostUserVringState::new(index, u32::from(base)))
    }

    /// A kick fd arriving is what starts a queue.
    fn set_vring_kick(&mut self, index: u8, fd: Option<File>) -> VhostResult<()> {
        let vring = self.vring(usize::from(index))?.clone();
        let kick = fd.map(|file| unsafe { EventFd::from_raw_fd(file.into_raw_fd()) });

        let pump_kick = {
            let _dispatch = self.device.dispatch_lock().write().unwrap();
            let mut vring = vring.lock().unwrap();
            vring.set_kick(kick);
            vring.set_ready(true);
            vring.kick_clone()
        };
        let pump_kick = pump_kick.ok_or(VhostError::InvalidParam)?;

        self.device
            .start_queue(u16::from(index), vring, pump_kick)
            .map_err(|e| {
                error!("failed to start queue {}: {}", index, e);
                VhostError::SlaveInternalError
            })
    }

    fn set_vring_call(&mut self, index: u8, fd: Option<File>) -> VhostResult<()> {
        let vring = self.vring(usize::from(index))?;
        let call = fd.map(|file| unsafe { EventFd::from_raw_fd(file.into_raw_fd()) });
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        vring.lock().unwrap().set_call(call);
        Ok(())
    }

    fn set_vring_err(&mut self, index: u8, fd: Option<File>) -> VhostResult<()> {
        let vring = self.vring(usize::from(index))?;
        let err = fd.map(|file| unsafe { EventFd::from_raw_fd(file.into_raw_fd()) });
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        vring.lock().unwrap().set_err(err);
        Ok(())
    }

    fn get_protocol_features(&mut self) -> VhostResult<VhostUserProtocolFeatures> {
        Ok(Device::protocol_features())
    }

    fn set_protocol_features(&mut self, features: u64) -> VhostResult<()> {
        if features & !Device::protocol_features().bits() != 0 {
            warn!("master acked protocol features we never offered: {:#x}", features);
        }
        self.acked_protocol_features = features;
        Ok(())
    }

    fn get_queue_num(&mut self) -> VhostResult<u64> {
        Ok(NUM_QUEUES as u64)
    }

    fn set_vring_enable(&mut self, index: u32, enable: bool) -> VhostResult<()> {
        let vring = self.vring(index as usize)?;
        debug!("queue {} enable={}", index, enable);
        let _dispatch = self.device.dispatch_lock().write().unwrap();
        vring.lock().unwrap().set_enabled(enable);
        Ok(())
    }

    fn get_config(
        &mut self,
        offset: u32,
        size: u32,
        _flags: VhostUserConfigFlags,
    ) -> VhostResult<Vec<u8>> {
        debug!("get_config: offset={} size={}", offset, size);
        if self.acked_protocol_features & VhostUserProtocolFeatures::CONFIG.bits() == 0 {
            return Err(VhostError::InvalidOperation);
        }
        let config = self.device.config();
        let bytes = config.as_slice();
        // The master may read any window of the config space.
        let start = offset as usize;
        if start > bytes.len() {
            return Err(VhostError::InvalidParam);
        }
        let end = min(bytes.len(), start + size as usize);
        Ok(bytes[start..end].to_vec())
    }

    fn set_config(&mut self, _offset: u32, _buf: &[u8], _flags: VhostUserConfigFlags) -> VhostResult<()> {
        // Nothing in our config space is writable by the master.
        warn!("set_config ignored");
        Ok(())
    }

    fn set_slave_req_fd(&mut self, vu_req: SlaveFsCacheReq) {
        self.device.set_slave_channel(vu_req);
    }

    fn get_inflight_fd(
        &mut self,
        _inflight: &VhostUserInflight,
    ) -> VhostResult<(VhostUserInflight, File)> {
        // Queue processing is not in order across the worker pool, and no
        // inflight tracking is offered.
        Err(VhostError::InvalidOperation)
    }

    fn set_inflight_fd(&mut self, _inflight: &VhostUserInflight, _file: File) -> VhostResult<()> {
        Err(VhostError::InvalidOperation)
    }

    fn get_max_mem_slots(&mut self) -> VhostResult<u64> {
        Err(VhostError::InvalidOperation)
    }

    fn add_mem_region(
        &mut self,
        _region: &VhostUserSingleMemoryRegion,
        _fd: File,
    ) -> VhostResult<()> {
        Err(VhostError::InvalidOperation)
    }

    fn remove_mem_region(&mut self, _region: &VhostUserSingleMemoryRegion) -> VhostResult<()> {
        Err(VhostError::InvalidOperation)
    }
}

impl std::fmt::Debug for VhostUserFsHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhostUserFsHandler")
            .field("owned", &self.owned)
            .field("acked_features", &self.acked_features)
            .finish()
    }
}

/// Take the pidfile lock for a socket path: `<dir>/<escaped-path>.pid`,
/// slashes replaced by dots, directory created 0700. Two daemons can never
/// share a socket path. The returned file holds the lock for the process
/// lifetime.
pub fn lock_socket_path(dir: &Path, socket_path: &Path) -> io::Result<File> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;

    let escaped = socket_path.to_string_lossy().replace('/', ".");
    let pid_path: PathBuf = dir.join(format!("{}.pid", escaped));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .mode(0o600)
        .open(&pid_path)?;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret < 0 {
        error!(
            "socket path {} is locked by another daemon",
            socket_path.display()
        );
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::ftruncate(file.as_raw_fd(), 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    writeln!(&file, "{}", process::id())?;
    Ok(file)
}

/// The control-plane loop: wait for the vhost-user socket, react to one
/// message at a time. Queue traffic runs on its own threads; this loop
/// only ever wakes for protocol messages.
pub struct Dispatcher {
    handler: SlaveReqHandler<Mutex<VhostUserFsHandler>>,
    _lock: File,
}

impl Dispatcher {
    pub fn run(&mut self) -> io::Result<()> {
        let epfd = epoll::create(true)?;
        epoll::ctl(
            epfd,
            ControlOptions::EPOLL_CTL_ADD,
            self.handler.as_raw_fd(),
            Event::new(Events::EPOLLIN, 0),
        )?;

        let result = loop {
            let mut events = [Event::new(Events::empty(), 0); 1];
            let count = match epoll::wait(epfd, -1, &mut events) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    info!("poll interrupted, going around");
                    continue;
                }
                Err(e) => break Err(e),
            };
            if count == 0 {
                continue;
            }
            let bad = Events::EPOLLERR.bits() | Events::EPOLLHUP.bits();
            if events[0].events & bad != 0 {
                info!("vhost-user socket closed");
                break Ok(());
            }

            debug!("dispatching one vhost-user message");
            match self.handler.handle_request() {
                Ok(()) => {}
                Err(VhostError::Disconnected | VhostError::PartialMessage) => {
                    info!("vhost-user connection ended");
                    break Ok(());
                }
                Err(e) => {
                    error!("vhost-user dispatch failed: {}", e);
                    break Err(io::Error::new(io::ErrorKind::Other, e));
                }
            }
        };

        unsafe { libc::close(epfd) };
        result
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish()
    }
}

/// Lock the socket path, listen, accept the single expected connection,
/// and wire the endpoint to the device. The listener is closed once the
/// connection is in.
pub fn mount(socket_path: &Path, state_dir: &Path, device: Arc<Device>) -> io::Result<Dispatcher> {
    let lock = lock_socket_path(state_dir, socket_path)?;

    let listener = Listener::new(socket_path, true).map_err(vu_err)?;
    let backend = Arc::new(Mutex::new(VhostUserFsHandler::new(device)));
    let mut slave_listener = SlaveListener::new(listener, backend).map_err(vu_err)?;

    info!("waiting for vhost-user socket connection...");
    let handler = loop {
        if let Some(handler) = slave_listener.accept().map_err(vu_err)? {
            break handler;
        }
    };
    info!("received vhost-user socket connection");

    // The listener goes out of scope here; one connection is all we take.
    Ok(Dispatcher {
        handler,
        _lock: lock,
    })
}

fn vu_err(e: VhostError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
