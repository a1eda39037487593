//! HTTP API: the `/api/v1/*` surface plus the REST server bootstrap. Ambient
//! health/metrics servers live in `main` rather than here, since they run on
//! separate ports and outlive the API-keyed router.

pub mod rest;
pub mod server;

pub use rest::RestRouter;
pub use server::{ApiServer, ApiServerConfig};
