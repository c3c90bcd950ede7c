pub mod error;
mod message;
mod message_dispatcher;
mod rpc_stream;
pub mod schema;
mod stdio;
mod utils;

pub use message::*;
pub use message_dispatcher::*;
pub use rpc_stream::*;
pub use stdio::*;
pub use utils::{await_timeout, CancellationError, CancellationToken, CancellationTokenSource};
