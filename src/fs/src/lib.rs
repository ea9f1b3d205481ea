//! Transport core of a vhost-user virtio-fs daemon.
//!
//! One side speaks vhost-user to the hypervisor over a unix socket; the
//! other side hands parsed FUSE requests to a filesystem layer through the
//! [`session::Filesystem`] seam and ferries its replies back into guest
//! descriptor chains. A slave channel lets the filesystem layer ask the
//! hypervisor to manipulate the DAX cache window and to bounce IO against
//! guest memory the daemon cannot map.

#![warn(clippy::pedantic)]
#![warn(missing_debug_implementations)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
mod utils;

pub mod buffer;
pub mod device;
pub mod fuse;
pub mod iov;
pub mod reply;
pub mod session;
pub mod slave;
pub mod vhost_user;
pub mod vring;

mod pool;
mod queue;
mod worker;
