//! Core interfaces.
mod env;
mod policy;
mod state;
pub use env::{Env, Step};
pub use policy::Policy;
pub use state::{StateBlob, Stateful};
