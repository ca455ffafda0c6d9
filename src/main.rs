use anyhow::Result;
use log::info;

use rtu_slave_rust::cli::{build_cli, handle_command};

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_logging(matches.get_count("verbose"));

    info!("🖥️  Modbus RTU slave v{}", rtu_slave_rust::VERSION);
    handle_command(&matches).await
}
