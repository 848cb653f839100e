//! Small shared helpers

pub mod executor;
pub mod throttle;
pub mod waiter;

pub use executor::{Executor, Task};
pub use throttle::LogThrottler;
pub use waiter::ThreadWaiter;
