pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod ws;

pub use error::ApiError;
pub use server::{router, start_server, AppState};
