//! Session layer: the data model, the atomic on-disk store, and the
//! fixed-slot multiplexer that bounds concurrently-live provider sessions.

mod model;
mod multiplexer;
mod store;

pub use model::{Session, SessionState};
pub use multiplexer::SessionMultiplexer;
pub use store::SessionStore;
