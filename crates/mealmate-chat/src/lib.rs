// Realtime chat for a single meeting: STOMP transport, inbound event
// decoding and the chat session state machine.

pub mod cursor;
pub mod event;
pub mod frame;
pub mod log;
pub mod send_guard;
pub mod session;
pub mod transport;

pub use session::{run, ChatCommand, ChatSession, ChatSettings, ChatUpdate, ConnectionStatus};
pub use transport::{TransportCommand, TransportEvent, TransportOptions};
