//! Data models for Azure Blob Storage.

mod blob;
mod block;
mod container;
mod kv;
mod page;

pub use blob::*;
pub use block::*;
pub use container::*;
pub use kv::*;
pub use page::*;
