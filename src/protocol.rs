//! Kernel protocol: version negotiation and the little-endian frame codec.

mod negotiator;
mod opcode;
mod reply;
mod request;
mod wire;

pub use negotiator::{ConnectionInfo, ProtocolNegotiator, MAX_MAJOR, MAX_MINOR, MIN_MAJOR};
pub use opcode::Opcode;
pub use reply::{
    dirent_size, encode_error, encode_reply, EntryOut, InitOut, Reply, ReplyFrame, WireAttr,
    WireEntry, OUT_HEADER_LEN,
};
pub use request::{decode, DecodeError, InHeader, KernelRequest, Operation, IN_HEADER_LEN};
pub use wire::{WireLayout, WireReader, WireWriter};
