#![deny(missing_docs)]
//! # Recorder
//! Logs the raw data stream of a u-blox receiver to a timestamped file
//! and/or relays it to other recorders over TCP.
mod config;
mod status;
use argh::FromArgs;
use log::{error, info, warn};
use std::{
    error::Error,
    fs::File,
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use ublox_raw_data::{
    run_reader, Bus, ParamStore, RawDataStream, RelayClient, RelayServer, SerialSource,
    SourceMode, UInt8MultiArray, RAW_DATA_TOPIC,
};

pub use config::DeviceCfg;
use status::Status;

#[derive(FromArgs, Debug)]
/// Log and relay the raw data stream of a u-blox receiver
struct Args {
    /// parameter file (JSON5)
    #[argh(option)]
    params: Option<PathBuf>,
    /// parameter override as name:=value, may be repeated
    #[argh(option, short = 'p')]
    param: Vec<String>,
    #[argh(subcommand)]
    mode: Mode,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Mode {
    Device(DeviceCfg),
    Last(LastCmd),
    Replay(ReplayCmd),
    Subscribe(SubscribeCmd),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "last")]
/// Read from the serial receiver of the stored configuration
struct LastCmd {}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "replay")]
/// Feed a recorded log file through the adapter as if read from the device
struct ReplayCmd {
    /// log file to replay
    #[argh(positional)]
    file: PathBuf,
    /// relay the published stream to TCP clients on this address
    #[argh(option)]
    relay: Option<String>,
    /// keep relaying for this many seconds after the file ends
    #[argh(option, default = "0")]
    linger: u64,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "subscribe")]
/// Log a stream relayed by another recorder
struct SubscribeCmd {
    /// address of the relaying recorder
    #[argh(positional)]
    addr: String,
}

type BoxResult<T> = Result<T, Box<dyn Error>>;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Args = argh::from_env();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> BoxResult<()> {
    let mut params = ParamStore::new();
    if let Some(path) = &args.params {
        params.load_file(path)?;
    }
    for arg in &args.param {
        params.apply_override(arg)?;
    }
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))?;
    }
    let bus = Bus::new();
    match args.mode {
        Mode::Device(cfg) => {
            if cfg.store {
                cfg.store_default()?;
                info!("Stored device configuration");
            }
            run_device(&cfg, params, bus, &stop)
        }
        Mode::Last(_) => {
            let cfg = DeviceCfg::load_default()
                .map_err(|e| format!("No stored device configuration: {e}"))?;
            info!("Using stored configuration for {}", cfg.serial_port);
            run_device(&cfg, params, bus, &stop)
        }
        Mode::Replay(cmd) => run_replay(&cmd, params, bus, &stop),
        Mode::Subscribe(cmd) => run_subscribe(&cmd, params, bus, &stop),
    }
}

/// Create and initialize the adapter, `None` if it has nothing to do
fn start_node(
    bus: &Bus<UInt8MultiArray>,
    params: ParamStore,
    mode: SourceMode,
) -> BoxResult<Option<RawDataStream>> {
    let mut node = RawDataStream::new(bus.clone(), params, mode)?;
    for name in node.params().undeclared_overrides() {
        warn!("Ignoring unknown parameter {name}");
    }
    node.get_params()?;
    if !node.is_enabled() {
        info!("Raw data stream is neither logged nor published, nothing to do.");
        return Ok(None);
    }
    node.initialize()?;
    Ok(Some(node))
}

fn start_relay(
    addr: Option<&str>,
    bus: &Bus<UInt8MultiArray>,
    node: &RawDataStream,
) -> BoxResult<Option<RelayServer>> {
    let Some(addr) = addr else {
        return Ok(None);
    };
    if !node.publish_enabled() {
        warn!("Relay requested but publishing is off, nothing will be relayed");
    }
    Ok(Some(RelayServer::bind(addr, bus, node.topic())?))
}

fn run_device(
    cfg: &DeviceCfg,
    params: ParamStore,
    bus: Bus<UInt8MultiArray>,
    stop: &AtomicBool,
) -> BoxResult<()> {
    let Some(node) = start_node(&bus, params, SourceMode::Device)? else {
        return Ok(());
    };
    let _relay = start_relay(cfg.relay.as_deref(), &bus, &node)?;
    let mut source =
        SerialSource::open(&cfg.serial_port, cfg.baud_rate, Duration::from_millis(cfg.timeout))?;
    let mut status = Status::new();
    let res = source.run(stop, |chunk| {
        node.ublox_callback(chunk);
        status.record(chunk.len());
        status.print(node.bytes_logged());
    });
    status.finish();
    node.flush()?;
    let total = res?;
    info!("Read {total} bytes from {}", source.name());
    Ok(())
}

fn run_replay(
    cmd: &ReplayCmd,
    params: ParamStore,
    bus: Bus<UInt8MultiArray>,
    stop: &AtomicBool,
) -> BoxResult<()> {
    let Some(node) = start_node(&bus, params, SourceMode::Device)? else {
        return Ok(());
    };
    let relay = start_relay(cmd.relay.as_deref(), &bus, &node)?;
    let mut file = File::open(&cmd.file)?;
    let mut status = Status::new();
    let total = run_reader(&mut file, stop, |chunk| {
        node.ublox_callback(chunk);
        status.record(chunk.len());
        status.print(node.bytes_logged());
    })?;
    status.finish();
    node.flush()?;
    info!("Replayed {total} bytes from {:?}", cmd.file);
    if relay.is_some() {
        for _ in 0..cmd.linger * 10 {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
    Ok(())
}

fn run_subscribe(
    cmd: &SubscribeCmd,
    params: ParamStore,
    bus: Bus<UInt8MultiArray>,
    stop: &AtomicBool,
) -> BoxResult<()> {
    let Some(node) = start_node(&bus, params, SourceMode::Subscriber)? else {
        return Ok(());
    };
    let publisher = bus.create_publisher("raw_data_relay", RAW_DATA_TOPIC)?;
    let client = RelayClient::connect(cmd.addr.as_str(), publisher)?;
    let mut status = Status::new();
    while !stop.load(Ordering::Relaxed) && !client.is_finished() {
        thread::sleep(Duration::from_millis(200));
        status.print(node.bytes_logged());
    }
    status.finish();
    client.shutdown();
    let frames = client.join()?;
    info!("Received {frames} messages from {}", cmd.addr);
    drop(node);
    Ok(())
}
