use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, trace, warn};

use super::cancellation::{CancellationToken, PendingRequests};
use super::handlers::Handlers;
use super::serializer::InodeSerializer;
use crate::protocol::{ConnectionInfo, KernelRequest, Operation, Reply};
use crate::session::Session;
use crate::types::*;

/// Receives the outcome of one request, exactly once.
pub type ReplyCallback = Box<dyn FnOnce(FsResult<Reply>) + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Resolving,
    Dispatching,
    Completed,
    Failed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Resolving => "resolving",
            RequestState::Dispatching => "dispatching",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct PendingRequest {
    request: KernelRequest,
    state: RequestState,
}

impl PendingRequest {
    fn new(request: KernelRequest) -> Self {
        trace!(
            "request {} {} on inode {}: {}",
            request.unique(),
            request.opcode(),
            request.target(),
            RequestState::Received
        );
        PendingRequest {
            request,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, state: RequestState) {
        trace!(
            "request {} {}: {} -> {}",
            self.request.unique(),
            self.request.opcode(),
            self.state,
            state
        );
        self.state = state;
    }

    fn run(&mut self, handlers: &Handlers, token: &CancellationToken) -> FsResult<Reply> {
        self.advance(RequestState::Resolving);
        handlers.session().inodes().resolve(self.request.target())?;
        self.advance(RequestState::Dispatching);
        match panic::catch_unwind(AssertUnwindSafe(|| handlers.handle(&self.request, token))) {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "{} panicked - {:?}",
                    self.request.opcode(),
                    self.request.info()
                );
                Err(FsError::internal(format!(
                    "{} handler panicked",
                    self.request.opcode()
                )))
            }
        }
    }

    fn finish(mut self, result: FsResult<Reply>, reply: ReplyCallback) {
        match &result {
            Ok(_) => self.advance(RequestState::Completed),
            Err(e) => {
                self.advance(RequestState::Failed);
                if e.kind() == ErrorKind::DataCorruption {
                    error!(
                        "{} {:?} - {:?}",
                        self.request.opcode().name(),
                        e,
                        self.request.info()
                    );
                } else {
                    warn!(
                        "{} {:?} - {:?}",
                        self.request.opcode().name(),
                        e,
                        self.request.info()
                    );
                }
            }
        }
        reply(result);
    }
}

/// Routes requests onto per-inode queues and reports each outcome through
/// its callback.
pub struct Dispatcher {
    handlers: Handlers,
    serializer: InodeSerializer,
    pending: Arc<PendingRequests>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>, connection: ConnectionInfo) -> Self {
        let workers = session.config().worker_count;
        Dispatcher {
            handlers: Handlers::new(session, connection),
            serializer: InodeSerializer::new(workers),
            pending: Arc::new(PendingRequests::new()),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.handlers.session()
    }

    /// Requests submitted and not yet answered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn submit(&self, request: KernelRequest, reply: ReplyCallback) {
        match &request.operation {
            Operation::Interrupt { unique } => {
                if !self.pending.interrupt(*unique) {
                    trace!("interrupt for finished request {}", unique);
                }
                reply(Ok(Reply::None));
            }
            Operation::Forget { .. } => {
                // the target may already be gone; no resolution step
                let handlers = self.handlers.clone();
                let key = request.target().as_raw();
                self.serializer.submit(
                    key,
                    Box::new(move || {
                        let token = CancellationToken::new();
                        reply(handlers.handle(&request, &token));
                    }),
                );
            }
            Operation::BatchForget { items } => {
                for &(ino, nlookup) in items {
                    let handlers = self.handlers.clone();
                    self.serializer
                        .submit(ino.as_raw(), Box::new(move || handlers.forget(ino, nlookup)));
                }
                reply(Ok(Reply::None));
            }
            _ => {
                let unique = request.unique();
                let key = request.target().as_raw();
                let token = self.pending.register(unique);
                let handlers = self.handlers.clone();
                let pending = self.pending.clone();
                self.serializer.submit(
                    key,
                    Box::new(move || {
                        let mut tracked = PendingRequest::new(request);
                        let result = tracked.run(&handlers, &token);
                        pending.complete(unique);
                        tracked.finish(result, reply);
                    }),
                );
            }
        }
    }

    /// Blocks until every submitted request has been answered.
    pub fn wait_idle(&self) {
        self.serializer.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::OsString;
    use std::sync::mpsc;

    use crate::config::ChannelConfig;
    use crate::protocol::ProtocolNegotiator;
    use crate::store::memory::{MemoryBackingStore, MemoryOverlayStore};

    fn dispatcher(files: &[(&str, &str)]) -> Dispatcher {
        let backing = Arc::new(MemoryBackingStore::new());
        let root = backing.build_tree(files);
        let config = ChannelConfig::default();
        let connection = ProtocolNegotiator::new(&config)
            .negotiate(7, 31, Capabilities::all())
            .unwrap();
        let session = Session::new(
            config,
            backing,
            Arc::new(MemoryOverlayStore::new()),
            root,
        );
        Dispatcher::new(Arc::new(session), connection)
    }

    fn call(dispatcher: &Dispatcher, request: KernelRequest) -> FsResult<Reply> {
        let (tx, rx) = mpsc::channel();
        dispatcher.submit(
            request,
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        );
        rx.recv().unwrap()
    }

    #[test]
    fn test_unknown_inode_is_stale() {
        let dispatcher = dispatcher(&[("a.txt", "x")]);
        let result = call(
            &dispatcher,
            KernelRequest::new(1, InodeNumber::from(99), Operation::Getattr { fh: None }),
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::StaleInode);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_lookup_then_forget() {
        let dispatcher = dispatcher(&[("a.txt", "x")]);
        let lookup = Operation::Lookup {
            name: OsString::from("a.txt"),
        };
        let Reply::Entry(entry) = call(&dispatcher, KernelRequest::new(1, ROOT_INODE, lookup)).unwrap() else {
            panic!("expected an entry reply");
        };
        assert_eq!(entry.attr.size, 1);

        let forget = KernelRequest::new(2, entry.attr.inode, Operation::Forget { nlookup: 1 });
        assert_eq!(call(&dispatcher, forget).unwrap(), Reply::None);
        assert!(!dispatcher.session().inodes().contains(entry.attr.inode));
    }

    #[test]
    fn test_interrupt_of_unknown_request_is_silent() {
        let dispatcher = dispatcher(&[]);
        let interrupt = KernelRequest::new(5, ROOT_INODE, Operation::Interrupt { unique: 4 });
        assert_eq!(call(&dispatcher, interrupt).unwrap(), Reply::None);
    }

    #[test]
    fn test_batch_forget_drops_every_item() {
        let dispatcher = dispatcher(&[("a.txt", "x"), ("b.txt", "y")]);
        let mut looked_up = Vec::new();
        for (unique, file) in [(1, "a.txt"), (2, "a.txt"), (3, "b.txt")] {
            let lookup = KernelRequest::new(unique, ROOT_INODE, Operation::Lookup { name: OsString::from(file) });
            let Reply::Entry(entry) = call(&dispatcher, lookup).unwrap() else {
                panic!("expected an entry reply");
            };
            looked_up.push(entry.attr.inode);
        }
        let (a, b) = (looked_up[0], looked_up[2]);
        assert_eq!(dispatcher.session().inodes().resolve(a).unwrap().lookup_count, 2);

        let batch = Operation::BatchForget {
            items: vec![(a, 2), (b, 1)],
        };
        assert_eq!(call(&dispatcher, KernelRequest::new(4, ROOT_INODE, batch)).unwrap(), Reply::None);
        dispatcher.wait_idle();
        assert!(!dispatcher.session().inodes().contains(a));
        assert!(!dispatcher.session().inodes().contains(b));
    }
}
