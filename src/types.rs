mod arguments;
mod errors;
mod flags;
mod inode;
mod object_id;

pub use self::{arguments::*, errors::*, flags::*, inode::*, object_id::*};
