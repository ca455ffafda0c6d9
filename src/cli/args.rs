use clap::{Arg, ArgAction, Command};

fn connection_args(station_help: &'static str) -> Vec<Arg> {
    vec![
        Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("TOML configuration file"),
        Arg::new("port")
            .short('p')
            .long("port")
            .value_name("PORT")
            .help("Serial port, e.g. /dev/ttyUSB0"),
        Arg::new("baud")
            .short('b')
            .long("baud")
            .value_name("RATE")
            .help("Baud rate"),
        Arg::new("parity")
            .long("parity")
            .value_name("none|even|odd")
            .help("Parity"),
        Arg::new("station")
            .short('s')
            .long("station")
            .value_name("ID")
            .help(station_help),
        Arg::new("clock")
            .long("clock")
            .value_name("HZ")
            .help("Silence timer tick frequency"),
    ]
}

const SLAVE_STATION_HELP: &str = "Station address answered by this slave (1-247, decimal or 0x..)";
const TARGET_STATION_HELP: &str = "Station address of the device to query (1-247, decimal or 0x..)";

fn master_args(value_name: &'static str, value_help: &'static str) -> Vec<Arg> {
    let mut args = connection_args(TARGET_STATION_HELP);
    args.push(Arg::new("address").required(true).help("Register address"));
    args.push(Arg::new(value_name).required(true).help(value_help));
    args.push(
        Arg::new("timeout")
            .short('t')
            .long("timeout")
            .value_name("MS")
            .default_value("1000")
            .help("Give up when the reply stalls for this long"),
    );
    args
}

fn frame_target_args(value_name: &'static str, value_help: &'static str) -> Vec<Arg> {
    vec![
        Arg::new("station").required(true).help("Station address"),
        Arg::new("address").required(true).help("Register address"),
        Arg::new(value_name).required(true).help(value_help),
    ]
}

pub fn build_cli() -> Command {
    Command::new("rtu-slave")
        .version(crate::VERSION)
        .about("Modbus RTU slave for an 8-bit register field device")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .subcommand(
            Command::new("serve")
                .about("Answer a Modbus RTU master on a serial port until Ctrl-C")
                .args(connection_args(SLAVE_STATION_HELP))
                .arg(
                    Arg::new("dump")
                        .long("dump")
                        .action(ArgAction::SetTrue)
                        .help("Print the register map as JSON on exit"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Feed one request through an in-memory slave and print the response")
                .args(connection_args(SLAVE_STATION_HELP))
                .arg(Arg::new("request").required(true).help("Request bytes as hex"))
                .arg(
                    Arg::new("raw")
                        .long("raw")
                        .action(ArgAction::SetTrue)
                        .help("Request already carries its CRC trailer"),
                ),
        )
        .subcommand(
            Command::new("read")
                .about("Act as master: read holding registers from a device")
                .args(master_args("count", "Number of registers")),
        )
        .subcommand(
            Command::new("write")
                .about("Act as master: write a single register on a device")
                .args(master_args("value", "Register value")),
        )
        .subcommand(
            Command::new("frame")
                .about("Build a master request frame with CRC")
                .subcommand_required(true)
                .subcommand(
                    Command::new("read")
                        .about("Read Holding Registers (0x03)")
                        .args(frame_target_args("count", "Number of registers")),
                )
                .subcommand(
                    Command::new("write")
                        .about("Write Single Register (0x06)")
                        .args(frame_target_args("value", "Register value")),
                ),
        )
        .subcommand(
            Command::new("crc")
                .about("Compute CRC16/MODBUS of hex bytes")
                .arg(Arg::new("bytes").required(true).help("Bytes as hex")),
        )
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(Arg::new("path").required(true).help("Destination TOML file")),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_serve_arguments() {
        let matches = build_cli()
            .try_get_matches_from(["rtu-slave", "-v", "serve", "-p", "/dev/ttyS1", "--station", "0x5A", "--dump"])
            .unwrap();

        assert_eq!(matches.get_count("verbose"), 1);
        let (name, serve) = matches.subcommand().unwrap();
        assert_eq!(name, "serve");
        assert_eq!(serve.get_one::<String>("port").unwrap(), "/dev/ttyS1");
        assert_eq!(serve.get_one::<String>("station").unwrap(), "0x5A");
        assert!(serve.get_flag("dump"));
        assert!(serve.get_one::<String>("baud").is_none());
    }

    #[test]
    fn test_master_read_arguments() {
        let matches = build_cli()
            .try_get_matches_from(["rtu-slave", "read", "-p", "/dev/ttyUSB0", "-s", "7", "0x10", "2"])
            .unwrap();

        let (name, read) = matches.subcommand().unwrap();
        assert_eq!(name, "read");
        assert_eq!(read.get_one::<String>("station").unwrap(), "7");
        assert_eq!(read.get_one::<String>("address").unwrap(), "0x10");
        assert_eq!(read.get_one::<String>("count").unwrap(), "2");
        assert_eq!(read.get_one::<String>("timeout").unwrap(), "1000");

        assert!(build_cli().try_get_matches_from(["rtu-slave", "write", "0x10"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(build_cli().try_get_matches_from(["rtu-slave"]).is_err());
        assert!(build_cli().try_get_matches_from(["rtu-slave", "frame"]).is_err());
    }
}
