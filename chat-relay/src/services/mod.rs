pub mod providers;
pub mod relay;

pub use relay::{relay_fragments, ChatRelay};
