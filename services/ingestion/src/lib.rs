pub mod api;
pub mod audit;
pub mod config;
pub mod rate_limit;
pub mod service;
pub mod transport;
pub mod transport_axum;

pub use service::IngestionRuntime;
pub use transport::{HttpRequest, HttpResponse, SharedRuntime, handle_request};
