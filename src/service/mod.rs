//! Service layer
//!
//! Business logic on top of the data layer: caching, population and
//! change notifications.

mod status;

pub use status::{Retrieval, StatusService};
