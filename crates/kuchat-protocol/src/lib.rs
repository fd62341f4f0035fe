//! ku-chat protocol - wire format for real-time connections
//!
//! Transport messages are length-prefixed (4-byte big-endian). Inbound
//! message bodies start with a 4-byte big-endian kind followed by a JSON
//! payload; outbound bodies are JSON event envelopes written verbatim.
//!
//! ```text
//! client -> server   [len:u32][kind:u32][payload ...]
//! server -> client   [len:u32]{"id":<event>,"data":{...}}
//! ```

pub mod codec;
pub mod event;
pub mod frame;
pub mod message;
pub mod version;

pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_LEN};
pub use event::{
    Connected, Envelope, ErrorNotice, EventKind, FriendRequestNotice, Pong, Replaced,
};
pub use frame::{Frame, FrameError, MalformedPayload, KIND_LEN};
pub use message::{kind, FriendRequest, Identify, Ping};
pub use version::ProtocolVersion;
