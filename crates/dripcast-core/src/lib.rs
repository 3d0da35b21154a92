//! # Dripcast Core
//!
//! Shared vocabulary for every Dripcast crate: configuration, the error
//! type, delivery content types, and the [`traits::Gateway`] seam that the
//! scheduler calls and the channel crates implement.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::DripConfig;
pub use error::{DripError, Result};
pub use traits::Gateway;
pub use types::{Button, ChatId, Content, DeliveryError, DeliveryOptions};
