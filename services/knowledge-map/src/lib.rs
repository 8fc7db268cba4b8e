pub mod api;
pub mod service;
pub mod transport;
pub mod transport_axum;

pub use service::KnowledgeMapRuntime;
pub use transport::{HttpRequest, HttpResponse, SharedRuntime, handle_request};
