pub mod app_config;
pub mod dispatcher;
pub mod logging;
pub mod pools;
pub mod resilience;
pub mod scheduler;

pub use app_config::*;
pub use dispatcher::*;
pub use logging::*;
pub use pools::validate_pools;
pub use resilience::*;
pub use scheduler::*;
