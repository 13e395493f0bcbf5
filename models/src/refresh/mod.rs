mod client;
mod crd;
pub mod drain;
pub mod error;
pub mod health;

pub use self::client::*;
pub use self::crd::*;
pub use self::drain::DrainOutcome;
pub use self::error::Error as NodeRefreshError;

#[cfg(feature = "mockall")]
pub use self::client::MockClusterClient;
