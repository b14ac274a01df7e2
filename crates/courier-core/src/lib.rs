//! courier-core: Shared protocol library for the courier messaging service.
//!
//! Provides CBOR message types, the length-prefixed frame codec, the error
//! taxonomy, and HMAC bearer tokens.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use error::{CourierError, CourierResult};
pub use messages::{MsgType, PROTOCOL_VERSION};
pub use codec::{frame_encode, frame_decode, cbor_decode};
pub use token::{create_token, generate_secret, load_or_create_secret, load_secret, verify_token};
