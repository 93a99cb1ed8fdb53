pub mod access;
pub mod handler;
pub mod registry;

pub use access::{AccessLevel, Caller, Permission};
pub use handler::{is_soft_error, Tool};
pub use registry::{RegisterOptions, ToolRegistration, ToolRegistry, ToolStats};
