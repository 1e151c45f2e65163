//! Agent inbox listeners, split into smaller files for readability.
//! - handler.rs: MessageHandler trait and stock handlers
//! - instance.rs: AgentListener (one inbox subscription) and its handle
//! - runtime.rs: ListenerRuntime managing one listener per agent

mod handler;
mod instance;
mod runtime;

pub use handler::{EchoHandler, FnHandler, MessageHandler, Reply, SilentHandler};
pub use instance::{AgentListener, ListenerHandle, ListenerState, ListenerStats};
pub use runtime::ListenerRuntime;
