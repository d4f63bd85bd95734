//! # evict-proto
//!
//! Wire protocol shared by the cache eviction transports and the relay server.
//!
//! This crate provides:
//!
//! - [`LocalIdentity`]: the 16-byte token every transport instance stamps on its frames
//! - [`OpCode`]: the operation carried by a frame (`Hello`, `Welcome`, `Evict`)
//! - [`FrameHeader`] and [`encode_frame`]: the fixed 20-byte header codec
//! - [`FrameCodec`]: a `tokio_util` codec for stream transports
//! - [`EndpointAddress`]: the `[user[:password]@]host:port` configuration string
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────────┬──────────────────┐
//! │ sender identity (16 B)   │ (len << 8) | opcode  (4 B LE) │ payload (len B)  │
//! └──────────────────────────┴──────────────────────────────┴──────────────────┘
//! ```
//!
//! The `SentByMe` bit is never transmitted. Each receiver derives it by
//! comparing the embedded identity with its own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod codec;
pub mod error;
pub mod frame;
pub mod identity;
pub mod opcode;

pub use address::EndpointAddress;
pub use codec::{Frame, FrameCodec};
pub use error::{AddressError, FrameError, FrameResult};
pub use frame::{encode_frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use identity::{LocalIdentity, IDENTITY_LEN};
pub use opcode::OpCode;
