pub mod error;
pub mod event;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
