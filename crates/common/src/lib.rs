//! Common types shared by the certlock crates.
//!
//! - [`ids`]: type-safe identifiers for locked resources and lease tokens
//! - [`namespace`]: mapping of logical keys into a prefixed key space
//! - [`context`]: deadline and cancellation signal carried by lock calls

pub mod context;
pub mod ids;
pub mod namespace;

pub use context::{Interrupt, LockContext};
pub use ids::{LeaseToken, ResourceName};
pub use namespace::{namespace, KeyNamespace, SEPARATOR};
