pub mod gate;
mod routes;

pub mod app;
pub mod config;
pub mod geometry;
pub mod inference;
pub mod normalize;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;

pub use app::start_app;
