//! The versioned, SQLite-backed record of every backup ever attempted
//! (spec.md §4.4 "Catalogue").

mod catalogue;
mod schema;

pub use catalogue::Catalogue;
pub use schema::CURRENT_VERSION;
