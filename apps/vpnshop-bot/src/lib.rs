pub mod bot;
pub mod config;
pub mod flow;
pub mod guard;
pub mod screen;
pub mod state;
pub mod sweep;
pub mod transport;

pub use state::AppState;
