// Service exports
pub mod identity;
pub mod memory;
pub mod postgres;
pub mod store;

pub use identity::{Claims, IdentityProvider, JwtIdentityProvider};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{BackingStore, Document};
