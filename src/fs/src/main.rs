use std::io;
use std::mem::size_of;
use std::panic;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use log::{error, info};
use structopt::StructOpt;
use vm_memory::{ByteValued, GuestMemoryAtomic, GuestMemoryMmap};

use vhost_user_fs::buffer::{Buf, BufVec};
use vhost_user_fs::device::Device;
use vhost_user_fs::fuse::{self, InHeader, Opcode, OutHeader};
use vhost_user_fs::reply::ReplyChannel;
use vhost_user_fs::session::{Filesystem, Session};
use vhost_user_fs::vhost_user;

/// Room for a 1 MiB write payload plus headers.
const REQUEST_BUF_SIZE: usize = (1 << 20) + 4096;

/// Stand-in filesystem layer: answers everything with ENOSYS. The real
/// one plugs in through the `Filesystem` trait.
#[derive(Debug)]
struct NullFs;

impl Filesystem for NullFs {
    fn process(&self, bufv: &BufVec<'_>, ch: &mut ReplyChannel) -> io::Result<()> {
        let hdr: InHeader = match bufv.bufs.first() {
            Some(Buf::Mem(buf)) => match fuse::parse(buf) {
                Some(hdr) => hdr,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };

        // Forgets never get a reply.
        if let Some(Opcode::Forget) | Some(Opcode::BatchForget) = Opcode::parse(hdr.opcode) {
            return Ok(());
        }

        let out = OutHeader {
            len: size_of::<OutHeader>() as u32,
            error: -libc::ENOSYS,
            unique: hdr.unique,
        };
        ch.send_reply(&[out.as_slice()])
    }
}

#[derive(StructOpt, Debug)]
struct Opt {
    /// vhost-user socket path to listen on
    #[structopt(long = "socket-path", parse(from_os_str))]
    socket_path: PathBuf,
    /// Number of worker threads shared by the queues
    #[structopt(long = "thread-pool-size", default_value = "64")]
    thread_pool_size: usize,
    /// Ring size for every virtqueue
    #[structopt(long = "queue-size", default_value = "1024")]
    queue_size: u16,
    /// Mount tag reported in the device config space
    #[structopt(long = "tag", default_value = "")]
    tag: String,
}

fn main() {
    env_logger::init();

    // A panic anywhere - a worker hitting an unhandled unmappable element
    // included - must take the whole daemon down, not just one thread.
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        default_hook(info);
        process::exit(1);
    }));

    let opt = Opt::from_args();

    let session = Arc::new(Session::new(
        Box::new(NullFs),
        REQUEST_BUF_SIZE,
        opt.thread_pool_size,
    ));
    let mem = GuestMemoryAtomic::new(GuestMemoryMmap::new());
    let device = Device::new(session, mem, &opt.tag, opt.queue_size);

    let mut dispatcher = match vhost_user::mount(
        &opt.socket_path,
        Path::new(vhost_user::DEFAULT_STATE_DIR),
        device,
    ) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("failed to set up {}: {}", opt.socket_path.display(), e);
            process::exit(1);
        }
    };

    if let Err(e) = dispatcher.run() {
        error!("dispatch loop failed: {}", e);
        process::exit(1);
    }
    info!("exiting");
}
