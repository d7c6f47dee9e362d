//! SQLite-backed session storage for spawned agents.

pub mod database;
pub mod error;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use sessions::SessionRepo;
