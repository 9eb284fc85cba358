pub mod error;
pub mod extract;
pub mod identity;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use identity::Identity;
pub use server::{router, GatewayServer};
pub use types::{AuditParams, CommandsParams, SubmitRequest, Submitted};
