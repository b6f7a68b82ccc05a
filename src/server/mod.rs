pub mod fastcgi;
pub mod http_server;
pub mod request;
pub mod request_job;
pub mod response;
pub mod router;
#[allow(clippy::module_inception)]
pub mod server;

pub use http_server::{QueueService, ServerHandle};
pub use request::Request;
pub use request_job::{RequestDispatcher, RequestJob};
pub use response::{ContentType, Response};
pub use router::Router;
pub use server::Server;
