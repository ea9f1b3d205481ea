//! Per-queue pump threads, created when a queue starts and torn down via a
//! kill eventfd when it stops.
//!
//! The request pump waits on the guest's kick, drains the queue in one
//! burst under the queue lock (shared dispatch lock held), and hands each
//! element to the worker pool. The notification-queue variant only clears
//! kicks; elements on that queue are popped by the notification sender.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use epoll::{ControlOptions, Event, Events};
use log::{debug, error, info};
use vmm_sys_util::eventfd::EventFd;

use crate::device::Device;
use crate::pool::Pool;
use crate::vring::Vring;

/// The per-queue state shared with workers: the index and the lock that
/// serializes every pop and push against protocol-side reconfiguration.
pub struct QueueInfo {
    pub qidx: u16,
    pub vring: Arc<Mutex<Vring>>,
}

/// Control-plane record of a started queue.
pub struct QueueHandle {
    pub info: Arc<QueueInfo>,
    pub kill: EventFd,
    pub thread: JoinHandle<()>,
}

pub fn spawn_pump(
    dev: Arc<Device>,
    info: Arc<QueueInfo>,
    kick: EventFd,
    kill: EventFd,
    notify_only: bool,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("vq{}", info.qidx))
        .spawn(move || {
            if notify_only {
                notify_pump(&info, &kick, &kill);
            } else {
                queue_pump(&dev, &info, &kick, &kill);
            }
        })
}

enum Wakeup {
    Kick,
    Kill,
    Failed,
}

const KICK_TOKEN: u64 = 0;
const KILL_TOKEN: u64 = 1;

struct Waiter {
    epfd: RawFd,
}

impl Waiter {
    fn new(kick: &EventFd, kill: &EventFd) -> io::Result<Self> {
        let epfd = epoll::create(true)?;
        epoll::ctl(
            epfd,
            ControlOptions::EPOLL_CTL_ADD,
            kick.as_raw_fd(),
            Event::new(Events::EPOLLIN, KICK_TOKEN),
        )?;
        epoll::ctl(
            epfd,
            ControlOptions::EPOLL_CTL_ADD,
            kill.as_raw_fd(),
            Event::new(Events::EPOLLIN, KILL_TOKEN),
        )?;
        Ok(Waiter { epfd })
    }

    /// Level-triggered wait, no timeout. The kill side wins when both are
    /// readable at once.
    fn wait(&self) -> Wakeup {
        let mut events = [Event::new(Events::empty(), 0); 2];
        loop {
            let count = match epoll::wait(self.epfd, -1, &mut events) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    info!("poll interrupted, going around");
                    continue;
                }
                Err(e) => {
                    error!("queue poll: {}", e);
                    return Wakeup::Failed;
                }
            };

            let bad = Events::EPOLLERR.bits() | Events::EPOLLHUP.bits();
            let mut kicked = false;
            for event in &events[..count] {
                if event.events & bad != 0 {
                    let events = event.events;
                    error!("unexpected poll events {:#x}", events);
                    return Wakeup::Failed;
                }
                match event.data {
                    KILL_TOKEN => return Wakeup::Kill,
                    KICK_TOKEN => kicked = true,
                    _ => {}
                }
            }
            if kicked {
                return Wakeup::Kick;
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // Registered fds outlive the epoll set; only the set itself goes.
        unsafe { libc::close(self.epfd) };
    }
}

/// Thread body for a hiprio or request queue.
fn queue_pump(dev: &Arc<Device>, info: &Arc<QueueInfo>, kick: &EventFd, kill: &EventFd) {
    let pool = Pool::new(dev.session().thread_pool_size(), dev.clone(), info.clone());

    info!(
        "pump start for queue {} kick_fd {}",
        info.qidx,
        kick.as_raw_fd()
    );
    let waiter = match Waiter::new(kick, kill) {
        Ok(waiter) => waiter,
        Err(e) => {
            error!("queue {} poll setup: {}", info.qidx, e);
            return;
        }
    };

    loop {
        debug!("waiting for queue {} event", info.qidx);
        match waiter.wait() {
            Wakeup::Kick => {}
            Wakeup::Kill => {
                info!("kill event on queue {} - quitting", info.qidx);
                break;
            }
            Wakeup::Failed => break,
        }

        // Read-to-clear; the burst below picks up everything that was
        // available at this point.
        let value = match kick.read() {
            Ok(value) => value,
            Err(e) => {
                error!("kick read for queue {}: {}", info.qidx, e);
                break;
            }
        };

        // Mutual exclusion with the protocol endpoint, then the queue lock
        // for the whole pop burst so no descriptor state change can
        // interleave.
        let batch = {
            let _dispatch = dev.dispatch_lock().read().unwrap();
            let mut vring = info.vring.lock().unwrap();
            let mut batch = Vec::new();
            while let Some(elem) = vring.pop() {
                batch.push(elem);
            }
            batch
        };
        debug!(
            "queue {} gave evalue {}: {} element(s) available",
            info.qidx,
            value,
            batch.len()
        );

        // Submission happens outside both locks: a full pool blocks here,
        // and the workers draining it need the locks we would be holding.
        for elem in batch {
            pool.push(elem);
        }
    }

    // Flush outstanding workers before the stop path may free the queue.
    pool.shutdown();
    info!("pump exit for queue {}", info.qidx);
}

/// Thread body for the notification queue: nothing to dispatch, just keep
/// the kick eventfd clear while notification sends pop elements elsewhere.
fn notify_pump(info: &Arc<QueueInfo>, kick: &EventFd, kill: &EventFd) {
    info!(
        "notify pump start for queue {} kick_fd {}",
        info.qidx,
        kick.as_raw_fd()
    );
    let waiter = match Waiter::new(kick, kill) {
        Ok(waiter) => waiter,
        Err(e) => {
            error!("queue {} poll setup: {}", info.qidx, e);
            return;
        }
    };

    loop {
        match waiter.wait() {
            Wakeup::Kick => {}
            Wakeup::Kill => {
                info!("kill event on queue {} - quitting", info.qidx);
                break;
            }
            Wakeup::Failed => break,
        }
        if let Err(e) = kick.read() {
            error!("kick read for queue {}: {}", info.qidx, e);
            break;
        }
        debug!("cleared kick on notification queue {}", info.qidx);
    }
    info!("notify pump exit for queue {}", info.qidx);
}
