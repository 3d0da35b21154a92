//! # Dripcast Channels
//! Messaging platform implementations of the delivery [`Gateway`](dripcast_core::Gateway).

pub mod telegram;

pub use telegram::{TelegramGateway, TelegramPollingStream, TelegramUpdate};
