//! Request and response bodies of the relay API.

pub mod chat;

pub use chat::{frame_fragment, ChatRequest, ChatResponse, FRAGMENT_DELIMITER};
