/// HTTP handlers for the aggregator API
pub mod events;
pub mod health;
pub mod publish;
pub mod stats;

pub use events::*;
pub use health::*;
pub use publish::*;
pub use stats::*;
