//! Delivery of fetched files into the chat

pub mod relay;
pub mod router;
pub mod thumbnail;
pub mod transport;

pub use relay::{MtProtoRelay, RelayChannel, RelayError, RelayTransport};
pub use router::{route_for, Delivered, DeliveryRequest, Route, UploadRouter};
pub use transport::{ChatTransport, OutgoingMedia, SentMedia, TelegramTransport};
