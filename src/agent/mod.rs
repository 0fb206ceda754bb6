pub mod events;
pub mod orchestrator;
pub mod session;

pub use events::{AgentEvent, EventReceiver};
pub use session::ChatSession;
