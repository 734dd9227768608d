//! HTTP surface of the central service: extender callbacks, agent pushes
//! and list/watch endpoints.

mod errors;
mod extender;
mod ingest;
mod server;
mod watch;

pub use errors::ApiError;
pub use ingest::IngestTarget;
pub use server::routes;
pub use server::ApiServer;
pub use server::ApiState;
