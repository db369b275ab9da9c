pub mod address;
pub mod error;
pub mod logging;
pub mod message;
pub mod status;

pub use address::{AddressEntry, AddressInput, AddressList};
pub use error::{AddressError, RequestError};
pub use message::{Body, DeliveryRequest, Recipients};
pub use status::{Reply, Status};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
