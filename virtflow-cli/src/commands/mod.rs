//! CLI command implementations

pub mod modules;
pub mod rebind;
pub mod status;

pub use modules::modules;
pub use rebind::{bind, unbind, GroupArgs};
pub use status::status;
