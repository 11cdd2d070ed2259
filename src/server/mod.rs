pub mod builder;
pub mod groups;
pub mod handler;
pub mod listener;

pub use builder::{BoundServer, ServerBuilder};
pub use groups::{GroupError, ProxyGroups};
pub use handler::ApiHandler;
