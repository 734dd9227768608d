pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export main modules
pub use domain::allocation;
pub use domain::index;
pub use domain::inventory;
pub use domain::liveness;
pub use domain::scheduler;
pub use infrastructure::k8s;
