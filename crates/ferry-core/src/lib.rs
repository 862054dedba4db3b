//! The conversation loop for Ferry: one user turn, as many tool rounds as
//! the model asks for, and a final answer.

pub mod conversation;

pub use conversation::{Conversation, ConversationEvent, MAX_TOOL_LOOPS};
