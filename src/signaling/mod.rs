pub mod memory;
pub mod transport;

pub use memory::MemoryHub;
pub use transport::{ChannelPipe, InboundFrame, OutboundFrame, SignalingConnector};
