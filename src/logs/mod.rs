//! Live log streaming: one tailing subprocess per job unit, fanned out to
//! WebSocket subscribers and persisted under the active cluster.

pub mod events;
pub mod multiplexer;
pub mod tailer;

pub use events::{ClientMessage, ServerEvent};
pub use multiplexer::{
    ConnectionId, EventSender, LogMultiplexer, SUBSCRIBER_QUEUE, StreamInfo, StreamKey, StreamMode,
};
pub use tailer::{KubectlLogTailer, LogTailer};
