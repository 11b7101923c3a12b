//! The HTTP transport: three routes over the service facade.

mod handlers;
mod middleware;
mod server;
mod types;

pub use server::{AppState, HttpServer};
