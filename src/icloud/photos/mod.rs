//! Photos service: paged enumeration of the primary library's CloudKit
//! records, decoded into [`MediaEntry`] values.

pub mod catalog;
pub mod cloudkit;
pub mod media;
pub mod queries;
pub mod session;

pub use catalog::{EntryStream, PhotoLibrary};
pub use media::MediaEntry;
pub use queries::CatalogQuery;
pub use session::RequestExecutor;
