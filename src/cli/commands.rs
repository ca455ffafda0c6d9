use anyhow::{Context, Result};
use clap::ArgMatches;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::settings::{parse_number, Config};
use crate::devices::register_map::RegisterMap;
use crate::modbus::crc::Crc16;
use crate::modbus::master::ModbusMaster;
use crate::modbus::protocol::{append_crc, MasterRequest};
use crate::modbus::silence::{HostTimer, SilenceDetector, SystemClock};
use crate::modbus::slave::{EngineStats, SlaveEngine};
use crate::modbus::transport::{BufferTransport, SerialTransport};
use crate::utils::error::ModbusError;

pub async fn handle_command(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("serve", sub)) => serve(sub).await,
        Some(("simulate", sub)) => simulate(sub),
        Some(("read", sub)) => master_read(sub).await,
        Some(("write", sub)) => master_write(sub).await,
        Some(("frame", sub)) => frame(sub),
        Some(("crc", sub)) => crc(sub),
        Some(("ports", _)) => list_ports(),
        Some(("init-config", sub)) => init_config(sub),
        _ => Ok(()),
    }
}

async fn serve(matches: &ArgMatches) -> Result<()> {
    let config = Config::from_matches(matches)?;
    config.validate()?;
    let station = config.station()?;
    let dump = matches.get_flag("dump");

    let stop = Arc::new(AtomicBool::new(false));
    let engine_stop = stop.clone();

    let engine = tokio::task::spawn_blocking(move || -> Result<(EngineStats, RegisterMap), ModbusError> {
        let transport = SerialTransport::open(
            &config.serial_port,
            config.baud_rate,
            &config.parity,
            config.read_poll_interval(),
            engine_stop,
        )?;
        let timer = HostTimer::new(SystemClock::new(config.clock_frequency_hz));
        let silence = SilenceDetector::new(timer, config.clock_frequency_hz, config.baud_rate)?;
        info!(
            "⏱️  Silence threshold: {} ticks at {} Hz ({} baud)",
            silence.ticks(),
            config.clock_frequency_hz,
            config.baud_rate
        );

        let backend = RegisterMap::with_presets(&config.initial_registers);
        let mut engine = SlaveEngine::new(station, transport, silence, backend);
        let stats = engine.run()?;
        let (_, _, backend) = engine.into_parts();
        Ok((stats, backend))
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, stopping slave...");
            stop.store(true, Ordering::Relaxed);
        }
    });

    let (stats, registers) = engine.await.context("slave engine task failed")??;

    info!(
        "📊 Served {} requests, {} exceptions, {} frames for other stations, {} CRC errors",
        stats.served, stats.exceptions, stats.not_addressed, stats.crc_errors
    );
    if dump {
        println!("{}", serde_json::to_string_pretty(&registers.to_json())?);
    }
    Ok(())
}

fn simulate(matches: &ArgMatches) -> Result<()> {
    let config = Config::from_matches(matches)?;
    config.validate()?;

    let mut request = parse_hex(required(matches, "request")?)?;
    if !matches.get_flag("raw") {
        append_crc(&mut request);
    }
    println!("→ {}", format_hex(&request));

    let response = simulate_request(&config, &request)?;
    println!("← {}", format_hex(&response));
    Ok(())
}

/// Runs `request` through a slave built from `config` on an in-memory line
/// and returns everything the slave transmitted.
pub fn simulate_request(config: &Config, request: &[u8]) -> Result<Vec<u8>, ModbusError> {
    let timer = HostTimer::new(SystemClock::new(config.clock_frequency_hz));
    let silence = SilenceDetector::new(timer, config.clock_frequency_hz, config.baud_rate)?;
    let backend = RegisterMap::with_presets(&config.initial_registers);
    let transport = BufferTransport::with_input(request);

    let mut engine = SlaveEngine::new(config.station()?, transport, silence, backend);
    let stats = engine.run()?;
    debug!("Simulation as station {} finished: {:?}", engine.station(), stats);

    Ok(engine.transport_mut().take_sent())
}

/// Opens the configured port as a master whose reads give up after the
/// `--timeout` given on the command line.
fn open_master(matches: &ArgMatches) -> Result<(Config, ModbusMaster<SerialTransport>)> {
    let config = Config::from_matches(matches)?;
    config.validate()?;
    let timeout: u64 = parse_number(required(matches, "timeout")?, "timeout")?;

    let transport = SerialTransport::open(
        &config.serial_port,
        config.baud_rate,
        &config.parity,
        config.read_poll_interval(),
        Arc::new(AtomicBool::new(false)),
    )?
    .with_receive_timeout(Duration::from_millis(timeout));
    Ok((config, ModbusMaster::new(transport)))
}

async fn master_read(matches: &ArgMatches) -> Result<()> {
    let address: u16 = parse_number(required(matches, "address")?, "address")?;
    let count: u16 = parse_number(required(matches, "count")?, "count")?;
    let (config, mut master) = open_master(matches)?;
    let station = config.station()?.get();

    let values = tokio::task::spawn_blocking(move || master.read_holding_registers(station, address, count))
        .await
        .context("master task failed")??;

    for (offset, value) in values.iter().enumerate() {
        println!("0x{:04X} = 0x{:04X} ({})", address as usize + offset, value, value);
    }
    Ok(())
}

async fn master_write(matches: &ArgMatches) -> Result<()> {
    let address: u16 = parse_number(required(matches, "address")?, "address")?;
    let value: u16 = parse_number(required(matches, "value")?, "value")?;
    let (config, mut master) = open_master(matches)?;
    let station = config.station()?.get();

    tokio::task::spawn_blocking(move || master.write_single_register(station, address, value))
        .await
        .context("master task failed")??;

    println!("✅ Register 0x{:04X} on station {} set to 0x{:04X}", address, station, value);
    Ok(())
}

fn frame(matches: &ArgMatches) -> Result<()> {
    let request = match matches.subcommand() {
        Some(("read", sub)) => MasterRequest::ReadHoldingRegisters {
            station: parse_number(required(sub, "station")?, "station")?,
            address: parse_number(required(sub, "address")?, "address")?,
            count: parse_number(required(sub, "count")?, "count")?,
        },
        Some(("write", sub)) => MasterRequest::WriteSingleRegister {
            station: parse_number(required(sub, "station")?, "station")?,
            address: parse_number(required(sub, "address")?, "address")?,
            value: parse_number(required(sub, "value")?, "value")?,
        },
        _ => return Ok(()),
    };

    println!("{}", format_hex(&request.encode()));
    Ok(())
}

fn crc(matches: &ArgMatches) -> Result<()> {
    let bytes = parse_hex(required(matches, "bytes")?)?;

    let mut crc = Crc16::new();
    crc.update(&bytes);
    let [lo, hi] = crc.trailer();
    println!("CRC16/MODBUS: 0x{:04X} (wire order: {:02X} {:02X})", crc.value(), lo, hi);
    Ok(())
}

fn list_ports() -> Result<()> {
    println!("📡 Available Serial Ports:");

    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("   ⚠️  No serial ports found");
        return Ok(());
    }

    for (index, port) in ports.iter().enumerate() {
        println!("   {}. {}", index + 1, port.port_name);
        if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
            if let Some(manufacturer) = &usb_info.manufacturer {
                println!("      📱 Manufacturer: {}", manufacturer);
            }
            if let Some(serial_number) = &usb_info.serial_number {
                println!("      🔢 Serial Number: {}", serial_number);
            }
        }
    }
    Ok(())
}

fn init_config(matches: &ArgMatches) -> Result<()> {
    let path = required(matches, "path")?;
    Config::default().save_to_file(path)?;
    println!("✅ Default configuration written to {}", path);
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a str, ModbusError> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| ModbusError::ConfigError(format!("missing argument '{}'", id)))
}

/// Hex bytes, whitespace and `:` separators allowed.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, ModbusError> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    Ok(hex::decode(digits)?)
}

pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
