pub mod browser;
pub mod name;
pub mod transport;

#[cfg(test)]
pub mod fake;

pub use browser::MdnsTransport;
pub use transport::{DiscoveryEvent, DiscoveryTransport, ResolvedService, Subscription};
