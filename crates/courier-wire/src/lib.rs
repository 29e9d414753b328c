pub mod error;
pub mod jid;
pub mod node;

pub use error::WireError;
pub use jid::{Jid, Server, STATUS_BROADCAST};
pub use node::{Node, NodeContent};
