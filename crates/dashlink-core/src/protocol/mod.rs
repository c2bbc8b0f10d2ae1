//! Display link protocol
//!
//! Line-oriented ASCII protocol between the vehicle computer and the
//! display microcontroller, carried over a single serial channel that is
//! owned by one worker thread.

pub mod channel;
pub mod codec;
mod error;
mod link;
pub mod scheduler;
pub mod serial;

pub use channel::{ChannelOpener, LinkChannel, SerialChannel, SerialOpener};
pub use codec::{
    parse_line, Acknowledgement, DiagnosticFrame, InboundMessage, LineBuffer, OutboundMessage,
    TelemetryFrame,
};
pub use error::{CodecError, LinkError};
pub use link::{ConnectionState, LinkListener, LinkSender, LinkStats, NoopListener, SerialLink};
pub use scheduler::{WriteDecision, WriteScheduler};
pub use serial::{list_ports, PortInfo};

/// Default baud rate for the display link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Largest single read from the channel
pub const READ_CHUNK_SIZE: usize = 512;

/// Reads performed per worker iteration while input keeps arriving
pub const MAX_READS_PER_ITERATION: usize = 8;
