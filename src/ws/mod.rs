pub mod connctx;
pub mod handler;

pub use handler::ws_handler;
