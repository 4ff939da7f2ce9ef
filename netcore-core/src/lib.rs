//! NetCore message bus: the host-agnostic half.
//! Link spec, message model, reliable wire framing and the pending call table. No sockets, no threads.

pub mod error;
pub mod pending;
pub mod protocol;
pub mod spec;
pub mod wire;

pub use error::NetCoreError;
pub use pending::{CallOutcome, PendingCall, PendingCalls};
pub use protocol::{
    CorrelationId, Envelope, Inbound, Notification, PayloadMessage, SyncedRequest, Value,
};
pub use spec::{Backoff, LinkSpec, Role, DEFAULT_SYNCED_CALL_TIMEOUT};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
