//! Async client for the ASP.NET Core SignalR hub protocol (version 1).
//!
//! ```no_run
//! use signalr_client::SignalRClient;
//!
//! # async fn example() -> signalr_client::error::Result<()> {
//! let client = SignalRClient::builder("https://example.com/chathub").build();
//! client.on("ReceiveMessage", |args| async move {
//!     println!("{args:?}");
//! });
//! client.run().await
//! # }
//! ```

pub mod client;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod url;

pub use client::{ClientStream, SignalRClient, SignalRClientBuilder};
pub use error::{HubError, Result};
pub use messages::Message;
