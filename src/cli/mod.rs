pub mod args;
pub mod commands;

pub use args::build_cli;
pub use commands::handle_command;
