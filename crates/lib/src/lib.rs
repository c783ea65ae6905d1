//! Convo core library: routes inbound chat messages (friend, group, temp) to per-counterpart
//! conversation procedures, each a sequential script that waits for its next message.

pub mod config;
pub mod dispatcher;
pub mod init;
pub mod message;
pub mod procedure;
pub mod registry;
pub mod transport;

pub use dispatcher::{Dispatch, DispatchError, Dispatcher, ProcedureFactory};
pub use message::{ContentItem, GroupInfo, Message, Sender, SourceType, UserInfo};
pub use procedure::{conversation_fn, Conversation, Procedure, ProcedureContext, ProcedureError};
pub use registry::ProcedureRegistry;
pub use transport::{Transport, TransportError, TransportEvent, UploadTarget};
