pub mod api;
pub mod models;

pub use api::{ErrorBody, link_url};
pub use models::{FileDescriptor, FileHandle};
