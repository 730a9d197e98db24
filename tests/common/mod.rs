#![allow(dead_code)]

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lazy_fuser::protocol::{KernelRequest, Operation, ReplyFrame, WireEntry, WireLayout};
use lazy_fuser::store::memory::{MemoryBackingStore, MemoryOverlayStore};
use lazy_fuser::types::*;
use lazy_fuser::{
    ChannelConfig, ChannelExit, KernelEndpoint, MemoryTransport, RequestChannel, Session,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

type ChannelThread = JoinHandle<FsResult<(RequestChannel<MemoryTransport>, ChannelExit)>>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn init_request(unique: u64, major: u32, minor: u32) -> KernelRequest {
    KernelRequest::new(
        unique,
        ROOT_INODE,
        Operation::Init {
            major,
            minor,
            max_readahead: 64 * 1024,
            flags: Capabilities::all().bits(),
        },
    )
}

/// A channel served on its own thread, driven from the kernel side of a
/// [`MemoryTransport`].
pub struct Mount {
    pub kernel: KernelEndpoint,
    pub backing: Arc<MemoryBackingStore>,
    pub overlay: Arc<MemoryOverlayStore>,
    pub session: Arc<Session>,
    pub layout: WireLayout,
    next_unique: AtomicU64,
    channel: Option<ChannelThread>,
}

impl Mount {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self::with_config(files, ChannelConfig::default().with_worker_count(4))
    }

    pub fn with_config(files: &[(&str, &str)], config: ChannelConfig) -> Self {
        init_logging();
        let backing = Arc::new(MemoryBackingStore::new());
        let root = backing.build_tree(files);
        let overlay = Arc::new(MemoryOverlayStore::new());
        let session = Arc::new(Session::new(
            config,
            backing.clone(),
            overlay.clone(),
            root,
        ));

        let (transport, kernel) = MemoryTransport::pair();
        let channel_session = session.clone();
        let channel = thread::spawn(move || {
            let channel = RequestChannel::handshake(transport, channel_session)?;
            let exit = channel.run()?;
            Ok((channel, exit))
        });

        kernel
            .send_request(&init_request(1, 7, 31), WireLayout::for_minor(0))
            .unwrap();
        let reply = ReplyFrame::parse(&kernel.recv_reply().unwrap()).unwrap();
        assert_eq!(reply.errno(), None, "INIT failed");
        let (major, minor, ..) = reply.init().unwrap();
        assert_eq!(major, 7);

        Mount {
            kernel,
            backing,
            overlay,
            session,
            layout: WireLayout::for_minor(minor),
            next_unique: AtomicU64::new(2),
            channel: Some(channel),
        }
    }

    /// Wraps an already running channel, e.g. one resumed after a takeover.
    pub fn attach(
        kernel: KernelEndpoint,
        backing: Arc<MemoryBackingStore>,
        overlay: Arc<MemoryOverlayStore>,
        channel: RequestChannel<MemoryTransport>,
        next_unique: u64,
    ) -> Self {
        let session = channel.session().clone();
        let layout = channel.connection().layout();
        let handle = thread::spawn(move || {
            let exit = channel.run()?;
            Ok((channel, exit))
        });
        Mount {
            kernel,
            backing,
            overlay,
            session,
            layout,
            next_unique: AtomicU64::new(next_unique),
            channel: Some(handle),
        }
    }

    pub fn next_unique(&self) -> u64 {
        self.next_unique.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends a request without waiting; returns its `unique`.
    pub fn send(&self, nodeid: InodeNumber, operation: Operation) -> u64 {
        let unique = self.next_unique();
        self.kernel
            .send_request(&KernelRequest::new(unique, nodeid, operation), self.layout)
            .unwrap();
        unique
    }

    pub fn receive(&self) -> ReplyFrame {
        let frame = self
            .kernel
            .recv_reply_timeout(TIMEOUT)
            .unwrap()
            .expect("no reply before timeout");
        ReplyFrame::parse(&frame).unwrap()
    }

    /// Collects `count` replies keyed by `unique`, in whatever order they come.
    pub fn receive_all(&self, count: usize) -> HashMap<u64, ReplyFrame> {
        (0..count)
            .map(|_| {
                let reply = self.receive();
                (reply.unique, reply)
            })
            .collect()
    }

    pub fn call(&self, nodeid: InodeNumber, operation: Operation) -> ReplyFrame {
        let unique = self.send(nodeid, operation);
        let reply = self.receive();
        assert_eq!(reply.unique, unique);
        reply
    }

    pub fn lookup(&self, parent: InodeNumber, name: &str) -> WireEntry {
        let reply = self.call(
            parent,
            Operation::Lookup {
                name: OsStr::new(name).to_os_string(),
            },
        );
        assert_eq!(reply.errno(), None, "lookup of {}", name);
        reply.entry(self.layout).unwrap()
    }

    pub fn open(&self, ino: InodeNumber, flags: OpenFlags) -> FileHandle {
        let reply = self.call(ino, Operation::Open { flags });
        assert_eq!(reply.errno(), None, "open of {}", ino);
        reply.open().unwrap()
    }

    pub fn read(&self, ino: InodeNumber, fh: FileHandle, offset: u64, size: u32) -> Vec<u8> {
        let reply = self.call(ino, Operation::Read { fh, offset, size });
        assert_eq!(reply.errno(), None, "read of {}", ino);
        reply.payload
    }

    pub fn write(&self, ino: InodeNumber, fh: FileHandle, offset: u64, data: &[u8]) -> u32 {
        let operation = Operation::Write {
            fh,
            offset,
            data: data.to_vec(),
        };
        let reply = self.call(ino, operation);
        assert_eq!(reply.errno(), None, "write to {}", ino);
        reply.written().unwrap()
    }

    pub fn release(&self, ino: InodeNumber, fh: FileHandle) {
        let operation = Operation::Release {
            fh,
            flags: OpenFlags::empty(),
        };
        assert_eq!(self.call(ino, operation).errno(), None);
    }

    /// Stops the channel's reader without closing the connection and hands
    /// back the stopped channel.
    pub fn stop_reader(mut self) -> (RequestChannel<MemoryTransport>, KernelEndpoint, u64) {
        self.kernel.detach_reader().unwrap();
        let (channel, exit) = self.join();
        assert_eq!(exit, ChannelExit::Closed);
        let next_unique = self.next_unique.load(Ordering::SeqCst);
        (channel, self.kernel, next_unique)
    }

    /// Closes the kernel side and waits for the channel to finish.
    pub fn shutdown(mut self) -> ChannelExit {
        self.kernel.close();
        self.join().1
    }

    fn join(&mut self) -> (RequestChannel<MemoryTransport>, ChannelExit) {
        self.channel
            .take()
            .expect("channel already joined")
            .join()
            .expect("channel thread panicked")
            .expect("channel failed")
    }
}
