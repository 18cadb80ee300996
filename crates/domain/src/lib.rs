//! Pure data types shared by every sandbox-broker crate: identifiers, the
//! wire event model, the error taxonomy, structured trace events, config,
//! and the session state machine. Nothing here holds a lock, a socket, or
//! a clock — those live in `sbx-broker` and `sbx-gateway`.

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod session;
pub mod tool;
pub mod trace;

pub use config::Config;
pub use error::{BrokerError, Result};
pub use event::{Event, EventBody, PROTOCOL_VERSION};
pub use ids::{CallId, ReferenceId, SessionId};
pub use session::{SessionInfo, SessionState};
pub use tool::ToolMeta;
pub use trace::TraceEvent;
