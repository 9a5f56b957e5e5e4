pub mod command;
pub mod prompts;

pub use command::CommandCapability;
