pub mod api;
pub mod auth;
pub mod client;
pub mod ws;

pub use client::KrakenClient;
