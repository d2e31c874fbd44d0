//! Wire protocol: framed messages, acknowledgement bookkeeping and the
//! per-connection agent that drives handshakes and transactions.

pub mod agent;
pub mod dispatcher;
pub mod message;
pub mod transport;

pub use agent::{AdmissionCheck, Agent, AgentEvent, AgentOptions, Phase, Role};
pub use dispatcher::EventDispatcher;
pub use message::{Message, HANDSHAKE_TEXT};
pub use transport::{MessageReader, Transport, DEFAULT_MAX_FRAME};
