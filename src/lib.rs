pub mod completion;
pub mod config;
pub mod error;
pub mod io_struct;
pub mod logging;
pub mod relay;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod terminal;
