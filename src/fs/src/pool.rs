//! A fixed pool of worker threads fed from a bounded channel, one pool per
//! request queue.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use log::debug;

use crate::device::Device;
use crate::queue::QueueInfo;
use crate::vring::Element;
use crate::worker;

pub struct Pool {
    sender: Option<Sender<Element>>,
    handles: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn new(size: usize, dev: Arc<Device>, qi: Arc<QueueInfo>) -> Self {
        let (sender, receiver) = bounded::<Element>(size * 2);
        let handles = (0..size)
            .map(|n| {
                let receiver = receiver.clone();
                let dev = dev.clone();
                let qi = qi.clone();
                thread::Builder::new()
                    .name(format!("vq{}-worker{}", qi.qidx, n))
                    .spawn(move || {
                        for elem in receiver.iter() {
                            worker::process_element(&dev, &qi, elem);
                        }
                        debug!("worker {} for queue {} shutting down", n, qi.qidx);
                    })
                    .expect("spawning worker thread")
            })
            .collect();
        Pool {
            sender: Some(sender),
            handles,
        }
    }

    /// Submit one element. The channel is bounded, so a busy pool blocks
    /// the caller; the caller must not be holding the queue or dispatch
    /// locks the workers need to finish.
    pub fn push(&self, elem: Element) {
        // Workers only exit once the sender is dropped, so this cannot
        // fail while the pool is alive.
        let _ = self.sender.as_ref().unwrap().send(elem);
    }

    /// Close the feed and wait for every outstanding worker.
    pub fn shutdown(mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
