mod codec;
mod messages;

pub use codec::{CodecError, TunnelCodec, MAX_FRAME_SIZE};
pub use messages::{ClientMessage, ServerMessage, TunnelState, TunnelSummary};
