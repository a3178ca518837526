//! Wire protocol: message model, body field codec, stream framing and the
//! message type code table

pub mod codes;
pub mod frame;
pub mod message;

pub use frame::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use message::{Message, MessageReader, MessageWriter};
