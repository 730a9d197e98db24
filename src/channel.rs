//! Request lifecycle: decode, route per inode, execute, translate, reply.

mod cancellation;
mod dispatcher;
mod error_translator;
mod handlers;
mod request_channel;
mod serializer;

pub use cancellation::{CancellationToken, PendingRequests};
pub use dispatcher::{Dispatcher, ReplyCallback, RequestState};
pub use error_translator::{translate, translate_kind};
pub use handlers::Handlers;
pub use request_channel::{ChannelExit, RequestChannel, TakeoverParts};
pub use serializer::{InodeSerializer, Job};
