pub mod audit;
pub mod engine;
pub mod handlers;
pub mod identities;
pub mod jobs;
pub mod middleware;
pub mod routes;
pub mod ws;

pub use routes::create_router;
pub use ws::{WsBroadcaster, WsMessage};
