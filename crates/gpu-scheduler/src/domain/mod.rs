pub mod allocation;
pub mod index;
pub mod inventory;
pub mod liveness;
pub mod scheduler;
