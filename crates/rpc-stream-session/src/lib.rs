//! Session orchestration for streamed JSON-RPC.
//!
//! Provides:
//! - `SessionRegistry` - Sessions, their streams and live transports
//! - `Dispatcher` - Run method handlers on their own request streams
//! - `Reconnector` - Resume a stream from a `Last-Event-ID`

pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod reconnect;
pub mod registry;
mod stream;

pub use dispatcher::{Dispatcher, HandlerError, MethodHandler, MethodRegistry};
pub use error::{RelayError, unresumable_hint};
pub use notifier::Notifier;
pub use reconnect::Reconnector;
pub use registry::{SessionRegistry, SweepReport};
pub use stream::Attachment;
