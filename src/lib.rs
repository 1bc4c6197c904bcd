// Client core of the chat app: store boundary, sync components and models
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use error::{ChatError, Result, StoreError};
pub use models::*;
pub use sync::Session;
