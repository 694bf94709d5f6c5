pub mod api;
pub mod config;
pub mod engine;
mod integrations;
pub mod pairing;

pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use config::format_diagnostics;
pub use engine::Engine;
pub use engine::State;
pub use pairing::PairingRegistry;
