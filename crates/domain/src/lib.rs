pub mod entities;
pub mod events;
pub mod ports;
pub mod value_objects;

pub use batchpool_errors::{SchedulerError, SchedulerResult};
pub use entities::*;
pub use events::*;
pub use ports::*;
pub use value_objects::*;
