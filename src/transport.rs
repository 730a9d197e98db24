//! Frame transport between the kernel side and the request channel.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{KernelRequest, WireLayout};

/// Carries whole frames. Implementations must be usable from the reader
/// thread and from workers sending replies at the same time.
pub trait KernelTransport: Send + Sync + 'static {
    /// Next request frame, or `None` once the kernel side is gone.
    fn receive(&self) -> io::Result<Option<Vec<u8>>>;

    fn send(&self, frame: &[u8]) -> io::Result<()>;
}

/// Channel-side half of an in-process transport.
pub struct MemoryTransport {
    requests: Mutex<Receiver<Option<Vec<u8>>>>,
    replies: Mutex<Sender<Vec<u8>>>,
}

/// Kernel-side half of an in-process transport, used to drive a channel
/// without a mount.
pub struct KernelEndpoint {
    requests: Mutex<Option<Sender<Option<Vec<u8>>>>>,
    replies: Mutex<Receiver<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, KernelEndpoint) {
        let (request_tx, request_rx) = mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::channel();
        (
            MemoryTransport {
                requests: Mutex::new(request_rx),
                replies: Mutex::new(reply_tx),
            },
            KernelEndpoint {
                requests: Mutex::new(Some(request_tx)),
                replies: Mutex::new(reply_rx),
            },
        )
    }
}

impl KernelTransport for MemoryTransport {
    fn receive(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.requests.lock().recv().ok().flatten())
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.replies
            .lock()
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "kernel endpoint closed"))
    }
}

impl KernelEndpoint {
    pub fn send_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        self.push(Some(frame))
    }

    fn push(&self, frame: Option<Vec<u8>>) -> io::Result<()> {
        match self.requests.lock().as_ref() {
            Some(sender) => sender
                .send(frame)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel stopped")),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")),
        }
    }

    pub fn send_request(&self, request: &KernelRequest, layout: WireLayout) -> io::Result<()> {
        self.send_frame(request.encode(layout))
    }

    /// Blocks for the next reply frame; `None` when the channel side is gone.
    pub fn recv_reply(&self) -> Option<Vec<u8>> {
        self.replies.lock().recv().ok()
    }

    pub fn recv_reply_timeout(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        match self.replies.lock().recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel side closed",
            )),
        }
    }

    /// Makes the reader see end of stream once while the pair stays usable,
    /// the way a daemon stops reading before handing its device to a successor.
    pub fn detach_reader(&self) -> io::Result<()> {
        self.push(None)
    }

    /// Simulates the kernel closing the device; the channel sees end of stream.
    pub fn close(&self) {
        self.requests.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_cross_in_order() {
        let (transport, endpoint) = MemoryTransport::pair();
        endpoint.send_frame(vec![1]).unwrap();
        endpoint.send_frame(vec![2]).unwrap();
        assert_eq!(transport.receive().unwrap(), Some(vec![1]));
        assert_eq!(transport.receive().unwrap(), Some(vec![2]));

        transport.send(&[9, 9]).unwrap();
        assert_eq!(endpoint.recv_reply(), Some(vec![9, 9]));
    }

    #[test]
    fn test_close_ends_the_stream() {
        let (transport, endpoint) = MemoryTransport::pair();
        endpoint.close();
        assert_eq!(transport.receive().unwrap(), None);
        assert!(endpoint.send_frame(vec![0]).is_err());
    }

    #[test]
    fn test_detached_reader_can_resume() {
        let (transport, endpoint) = MemoryTransport::pair();
        endpoint.detach_reader().unwrap();
        endpoint.send_frame(vec![4]).unwrap();
        assert_eq!(transport.receive().unwrap(), None);
        assert_eq!(transport.receive().unwrap(), Some(vec![4]));
    }

    #[test]
    fn test_timeout_without_reply() {
        let (_transport, endpoint) = MemoryTransport::pair();
        let reply = endpoint
            .recv_reply_timeout(Duration::from_millis(10))
            .unwrap();
        assert!(reply.is_none());
    }
}
