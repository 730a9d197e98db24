use std::sync::Arc;

use log::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::error_translator::translate;
use crate::core::TakeoverData;
use crate::protocol::{
    decode, encode_error, encode_reply, ConnectionInfo, DecodeError, InHeader, Opcode, Operation,
    ProtocolNegotiator, Reply, WireLayout,
};
use crate::session::Session;
use crate::transport::KernelTransport;
use crate::types::*;

/// Why [`RequestChannel::run`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelExit {
    /// The kernel closed the transport.
    Closed,
    /// The kernel sent DESTROY.
    Destroyed,
}

fn send_frame<T: KernelTransport>(transport: &T, frame: &[u8], unique: u64) {
    if let Err(e) = transport.send(frame) {
        warn!("sending reply to request {}: {}", unique, e);
    }
}

fn send_error<T: KernelTransport>(transport: &T, unique: u64, error: &FsError) {
    send_frame(transport, &encode_error(unique, translate(error)), unique);
}

/// Carries requests from a transport into the dispatcher and replies back.
///
/// A channel only exists after a successful handshake (or a resume from a
/// previous daemon), so every request it decodes uses the negotiated layout.
pub struct RequestChannel<T: KernelTransport> {
    transport: Arc<T>,
    connection: ConnectionInfo,
    dispatcher: Dispatcher,
}

impl<T: KernelTransport> RequestChannel<T> {
    /// Waits for INIT and answers it.
    pub fn handshake(transport: T, session: Arc<Session>) -> FsResult<Self> {
        let transport = Arc::new(transport);
        let frame = transport.receive()?.ok_or_else(|| {
            FsError::new(
                ErrorKind::GenericError,
                "transport closed before the handshake",
            )
        })?;

        // Before negotiation only the INIT layout, fixed since 7.0, is known.
        let header = InHeader::decode(&frame)?;
        let request = match decode(&frame, WireLayout::for_minor(0)) {
            Ok(request) if request.opcode() == Opcode::Init => request,
            Ok(_) | Err(DecodeError::Payload { .. }) => {
                let error = FsError::new(
                    ErrorKind::ProtocolMismatch,
                    format!("expected INIT, got opcode {}", header.opcode),
                );
                send_error(transport.as_ref(), header.unique, &error);
                return Err(error);
            }
            Err(DecodeError::Header(e)) => return Err(e),
        };
        let Operation::Init {
            major,
            minor,
            max_readahead,
            flags,
        } = request.operation
        else {
            return Err(FsError::internal("INIT decoded without its arguments"));
        };

        let negotiator = ProtocolNegotiator::new(session.config());
        let connection = match negotiator.handshake(major, minor, max_readahead, flags) {
            Ok(connection) => connection,
            Err(e) => {
                send_error(transport.as_ref(), header.unique, &e);
                return Err(e);
            }
        };
        let reply = Reply::Init(negotiator.init_reply(&connection));
        if let Some(frame) = encode_reply(header.unique, &reply, connection.layout()) {
            transport.send(&frame)?;
        }
        Ok(Self::resume(transport, session, connection))
    }

    /// Continues serving a connection negotiated by a previous daemon.
    pub fn resume(transport: Arc<T>, session: Arc<Session>, connection: ConnectionInfo) -> Self {
        info!(
            "serving protocol {}.{} with {} workers",
            connection.major,
            connection.minor,
            session.config().worker_count
        );
        RequestChannel {
            transport,
            connection,
            dispatcher: Dispatcher::new(session, connection),
        }
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.connection
    }

    pub fn session(&self) -> &Arc<Session> {
        self.dispatcher.session()
    }

    /// Serves requests until the kernel goes away or sends DESTROY.
    ///
    /// Malformed frames are answered (or dropped when not even their header
    /// is readable); they never stop the channel.
    pub fn run(&self) -> FsResult<ChannelExit> {
        let layout = self.connection.layout();
        loop {
            let Some(frame) = self.transport.receive()? else {
                debug!("transport closed");
                self.dispatcher.wait_idle();
                return Ok(ChannelExit::Closed);
            };
            let request = match decode(&frame, layout) {
                Ok(request) => request,
                Err(DecodeError::Header(e)) => {
                    warn!("dropping unreadable frame of {} bytes: {}", frame.len(), e);
                    continue;
                }
                Err(DecodeError::Payload { header, error }) => {
                    warn!("request {} (opcode {}): {}", header.unique, header.opcode, error);
                    send_error(self.transport.as_ref(), header.unique, &error);
                    continue;
                }
            };

            match request.operation {
                Operation::Init { .. } => {
                    let error = FsError::new(ErrorKind::GenericError, "INIT after handshake");
                    warn!("{}", error);
                    send_error(self.transport.as_ref(), request.unique(), &error);
                }
                Operation::Destroy => {
                    info!("kernel sent DESTROY");
                    self.dispatcher.wait_idle();
                    if let Some(frame) = encode_reply(request.unique(), &Reply::Empty, layout) {
                        send_frame(self.transport.as_ref(), &frame, request.unique());
                    }
                    return Ok(ChannelExit::Destroyed);
                }
                _ => {
                    let transport = self.transport.clone();
                    let unique = request.unique();
                    self.dispatcher.submit(
                        request,
                        Box::new(move |result| {
                            let frame = match result {
                                Ok(reply) => encode_reply(unique, &reply, layout),
                                Err(e) => Some(encode_error(unique, translate(&e))),
                            };
                            if let Some(frame) = frame {
                                send_frame(transport.as_ref(), &frame, unique);
                            }
                        }),
                    );
                }
            }
        }
    }

    /// Stops dispatching and captures what a successor daemon needs.
    pub fn into_takeover(self) -> FsResult<TakeoverParts<T>> {
        self.dispatcher.wait_idle();
        let data = self.session().takeover_data(self.connection)?;
        Ok(TakeoverParts {
            transport: self.transport,
            data,
        })
    }
}

/// The live transport and the serialized state handed to a successor.
pub struct TakeoverParts<T> {
    pub transport: Arc<T>,
    pub data: TakeoverData,
}
