pub mod notifier;
pub mod queue;
pub mod store;
pub mod tickets;
pub mod transport;

pub use notifier::*;
pub use queue::*;
pub use store::*;
pub use tickets::*;
pub use transport::*;
