use chrono::{DateTime, Local, TimeZone};
use log::{error, info, warn};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;

use crate::{
    bus::{Bus, BusError, Publisher, Subscription},
    file_sink::FileSink,
    msg::UInt8MultiArray,
    params::{ParamError, ParamStore},
};

/// Name under which the adapter registers itself on the bus
pub const NODE_NAME: &str = "raw_data_pa";
/// Topic carrying the raw receiver stream
pub const RAW_DATA_TOPIC: &str = "raw_data_stream";
/// Queue depth of the raw data subscription
pub const QUEUE_DEPTH: usize = 100;

/// Log directory when fed from the bus
pub const PARAM_DIR: &str = "dir";
/// Log directory when fed from the device
pub const PARAM_STREAM_DIR: &str = "raw_data_stream.dir";
/// Republish device data on the bus
pub const PARAM_STREAM_PUBLISH: &str = "raw_data_stream.publish";

#[derive(Error, Debug)]
/// Errors raised while setting up the adapter
pub enum RawDataError {
    /// Parameter declaration or lookup failed
    #[error(transparent)]
    Param(#[from] ParamError),
    /// Publisher or subscription could not be created
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where the raw bytes come from
pub enum SourceMode {
    /// Chunks are handed over by the device driver
    Device,
    /// Chunks arrive as messages on the raw data topic
    Subscriber,
}

type SharedSink = Arc<Mutex<Option<FileSink>>>;

fn save_to_file(file: &SharedSink, data: &[u8]) {
    let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(sink) = file.as_mut() {
        if let Err(e) = sink.write(data) {
            warn!("Error writing to file {:?}: {e}", sink.path());
        }
    }
}

/// Logs the raw receiver stream to a file and/or republishes it on the bus.
///
/// Both outputs are best-effort and independent of each other: a failing
/// file never stops publishing and no error reaches the data source.
pub struct RawDataStream {
    mode: SourceMode,
    bus: Bus<UInt8MultiArray>,
    params: ParamStore,
    publisher: Publisher<UInt8MultiArray>,
    subscription: Option<Subscription<UInt8MultiArray>>,
    file_dir: String,
    flag_publish: bool,
    file: SharedSink,
}

impl RawDataStream {
    /// Declare the adapter parameters and create the raw data publisher
    pub fn new(
        bus: Bus<UInt8MultiArray>,
        mut params: ParamStore,
        mode: SourceMode,
    ) -> Result<Self, RawDataError> {
        let publisher = bus.create_publisher(NODE_NAME, "~/raw_data_stream")?;
        params.declare_parameter(PARAM_DIR, "")?;
        params.declare_parameter(PARAM_STREAM_DIR, "")?;
        params.declare_parameter(PARAM_STREAM_PUBLISH, false)?;
        Ok(Self {
            mode,
            bus,
            params,
            publisher,
            subscription: None,
            file_dir: String::new(),
            flag_publish: false,
            file: Arc::new(Mutex::new(None)),
        })
    }

    /// Read the parameters that apply to the source mode
    pub fn get_params(&mut self) -> Result<(), ParamError> {
        match self.mode {
            SourceMode::Subscriber => {
                self.file_dir = self.params.get_parameter(PARAM_DIR)?;
            }
            SourceMode::Device => {
                self.file_dir = self.params.get_parameter(PARAM_STREAM_DIR)?;
                self.flag_publish = self.params.get_parameter(PARAM_STREAM_PUBLISH)?;
            }
        }
        Ok(())
    }

    /// Whether there is anything to do with the incoming data
    pub fn is_enabled(&self) -> bool {
        match self.mode {
            SourceMode::Subscriber => !self.file_dir.is_empty(),
            SourceMode::Device => self.flag_publish || !self.file_dir.is_empty(),
        }
    }

    /// Set up the outputs, naming the log file after the current local time
    pub fn initialize(&mut self) -> Result<(), RawDataError> {
        self.initialize_at(&Local::now())
    }

    /// Set up the outputs, naming the log file after `tstamp`.
    ///
    /// A log file that cannot be opened is reported and file logging stays
    /// off for the lifetime of the adapter.
    pub fn initialize_at<Tz: TimeZone>(
        &mut self,
        tstamp: &DateTime<Tz>,
    ) -> Result<(), RawDataError>
    where
        Tz::Offset: Display,
    {
        if !self.file_dir.is_empty() {
            match FileSink::open(Path::new(&self.file_dir), tstamp) {
                Ok(sink) => {
                    info!("Logging raw data to file {:?}", sink.path());
                    *self.file.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
                }
                Err(e) => error!("{e}"),
            }
        }

        match self.mode {
            SourceMode::Subscriber => {
                info!("Subscribing to raw data stream.");
                let file = self.file.clone();
                self.subscription = Some(self.bus.create_subscription(
                    NODE_NAME,
                    RAW_DATA_TOPIC,
                    QUEUE_DEPTH,
                    move |msg: UInt8MultiArray| save_to_file(&file, msg.as_bytes()),
                )?);
            }
            SourceMode::Device if self.flag_publish => {
                info!("Publishing raw data stream.");
                self.publish_msg(&[]);
            }
            SourceMode::Device => {}
        }
        Ok(())
    }

    /// Entry point for chunks read from the device
    pub fn ublox_callback(&self, data: &[u8]) {
        if self.flag_publish {
            self.publish_msg(data);
        }
        save_to_file(&self.file, data);
    }

    /// Entry point for messages received from the bus
    pub fn msg_callback(&self, msg: &UInt8MultiArray) {
        save_to_file(&self.file, msg.as_bytes());
    }

    /// Publish a chunk on the raw data topic
    pub fn publish_msg(&self, data: &[u8]) {
        self.publisher.publish(UInt8MultiArray::from_bytes(data));
    }

    /// Push buffered log data to disk
    pub fn flush(&self) -> std::io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        match file.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }

    /// Path of the open log file, if file logging is active
    pub fn file_path(&self) -> Option<PathBuf> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.as_ref().map(|sink| sink.path().to_path_buf())
    }

    /// Bytes that reached the log file so far
    pub fn bytes_logged(&self) -> u64 {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.as_ref().map_or(0, |sink| sink.bytes_written())
    }

    /// Source mode of the adapter
    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    /// Whether device data is republished
    pub fn publish_enabled(&self) -> bool {
        self.flag_publish
    }

    /// Absolute name of the topic data is published on
    pub fn topic(&self) -> &str {
        self.publisher.topic()
    }

    /// The parameters of the adapter
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Mutable access to the parameters; call [`RawDataStream::get_params`]
    /// to pick up changes
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::FixedOffset;
    use std::{sync::mpsc::channel, time::Duration};

    fn tstamp() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2019, 11, 2, 14, 30, 0)
            .unwrap()
    }

    fn adapter(bus: &Bus<UInt8MultiArray>, mode: SourceMode, overrides: &[&str]) -> RawDataStream {
        let mut params = ParamStore::new();
        for o in overrides {
            params.apply_override(o).unwrap();
        }
        let mut node = RawDataStream::new(bus.clone(), params, mode).unwrap();
        node.get_params().unwrap();
        node
    }

    #[test]
    fn test_is_enabled() {
        let bus = Bus::<UInt8MultiArray>::new();
        assert!(!adapter(&bus, SourceMode::Device, &[]).is_enabled());
        assert!(adapter(&bus, SourceMode::Device, &["raw_data_stream.publish:=true"]).is_enabled());
        assert!(adapter(&bus, SourceMode::Device, &["raw_data_stream.dir:=/tmp"]).is_enabled());
        // the device parameters are ignored when reading from the bus
        assert!(!adapter(
            &bus,
            SourceMode::Subscriber,
            &["raw_data_stream.dir:=/tmp", "raw_data_stream.publish:=true"]
        )
        .is_enabled());
        assert!(adapter(&bus, SourceMode::Subscriber, &["dir:=/tmp"]).is_enabled());
    }

    #[test]
    fn test_device_publish_and_log() {
        let bus = Bus::<UInt8MultiArray>::new();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel();
        let _sub = bus
            .create_subscription("listener", "/raw_data_pa/raw_data_stream", 100, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        let dir_override = format!("raw_data_stream.dir:={}", dir.path().display());
        let mut node = adapter(
            &bus,
            SourceMode::Device,
            &["raw_data_stream.publish:=true", dir_override.as_str()],
        );
        assert_eq!(node.topic(), "/raw_data_pa/raw_data_stream");
        node.initialize_at(&tstamp()).unwrap();

        let announce: UInt8MultiArray = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(announce.is_empty());
        assert_eq!(announce.layout.dim[0].size, 0);

        node.ublox_callback(b"\xb5\x62\x02\x15");
        node.ublox_callback(b"$GNRMC,*00\r\n");
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, UInt8MultiArray::from_bytes(b"\xb5\x62\x02\x15"));
        assert_eq!(second.as_bytes(), b"$GNRMC,*00\r\n");

        let path = node.file_path().unwrap();
        assert_eq!(path, dir.path().join("2019_11_02_1430.log"));
        node.flush().unwrap();
        assert_eq!(node.bytes_logged(), 16);
        assert_eq!(std::fs::read(path).unwrap(), b"\xb5\x62\x02\x15$GNRMC,*00\r\n");
    }

    #[test]
    fn test_device_log_only_does_not_publish() {
        let bus = Bus::<UInt8MultiArray>::new();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel();
        let _sub = bus
            .create_subscription("listener", "/raw_data_pa/raw_data_stream", 100, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        let dir_override = format!("raw_data_stream.dir:={}", dir.path().display());
        let mut node = adapter(&bus, SourceMode::Device, &[dir_override.as_str()]);
        node.initialize_at(&tstamp()).unwrap();
        node.ublox_callback(b"abc");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        let path = node.file_path().unwrap();
        drop(node);
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }

    #[test]
    fn test_missing_directory_keeps_publishing() {
        let bus = Bus::<UInt8MultiArray>::new();
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = channel();
        let _sub = bus
            .create_subscription("listener", "/raw_data_pa/raw_data_stream", 100, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        let dir_override = format!(
            "raw_data_stream.dir:={}",
            dir.path().join("missing").display()
        );
        let mut node = adapter(
            &bus,
            SourceMode::Device,
            &["raw_data_stream.publish:=true", dir_override.as_str()],
        );
        node.initialize_at(&tstamp()).unwrap();
        assert!(node.file_path().is_none());
        node.ublox_callback(b"still here");
        let _announce = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.as_bytes(), b"still here");
        assert_eq!(node.bytes_logged(), 0);
    }

    #[test]
    fn test_create_failure_keeps_publishing() {
        let bus = Bus::<UInt8MultiArray>::new();
        let dir = tempfile::tempdir().unwrap();
        // the directory is fine, the log file name is taken by a directory
        std::fs::create_dir(dir.path().join("2019_11_02_1430.log")).unwrap();
        let (tx, rx) = channel();
        let _sub = bus
            .create_subscription("listener", "/raw_data_pa/raw_data_stream", 100, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        let dir_override = format!("raw_data_stream.dir:={}", dir.path().display());
        let mut node = adapter(
            &bus,
            SourceMode::Device,
            &["raw_data_stream.publish:=true", dir_override.as_str()],
        );
        node.initialize_at(&tstamp()).unwrap();
        assert!(node.file_path().is_none());
        node.ublox_callback(b"\xb5\x62\x01\x07");
        let announce = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(announce.is_empty());
        let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(msg.as_bytes(), b"\xb5\x62\x01\x07");
        assert_eq!(node.bytes_logged(), 0);
        node.flush().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_write_failure_keeps_publishing() {
        let bus = Bus::<UInt8MultiArray>::new();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/dev/full", dir.path().join("2019_11_02_1430.log")).unwrap();
        let (tx, rx) = channel();
        let _sub = bus
            .create_subscription("listener", "/raw_data_pa/raw_data_stream", 100, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        let dir_override = format!("raw_data_stream.dir:={}", dir.path().display());
        let mut node = adapter(
            &bus,
            SourceMode::Device,
            &["raw_data_stream.publish:=true", dir_override.as_str()],
        );
        node.initialize_at(&tstamp()).unwrap();
        assert!(node.file_path().is_some());

        // larger than the write buffer, so it fails on the spot
        let burst = vec![0xb5u8; 10_000];
        node.ublox_callback(&burst);
        node.ublox_callback(b"tail");
        let _announce = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.as_bytes(), &burst[..]);
        assert_eq!(second.as_bytes(), b"tail");

        assert!(node.flush().is_err());
        assert_eq!(node.bytes_logged(), 0);
    }

    #[test]
    fn test_subscriber_logs_bus_messages() {
        let bus = Bus::<UInt8MultiArray>::new();
        let dir = tempfile::tempdir().unwrap();
        let dir_override = format!("dir:={}", dir.path().display());
        let mut node = adapter(&bus, SourceMode::Subscriber, &[dir_override.as_str()]);
        assert!(!node.publish_enabled());
        node.initialize_at(&tstamp()).unwrap();
        assert_eq!(bus.subscriber_count("/raw_data_stream"), 1);

        let remote = bus
            .create_publisher("relay", "/raw_data_stream")
            .unwrap();
        remote.publish(UInt8MultiArray::from_bytes(b"one,"));
        remote.publish(UInt8MultiArray::from_bytes(b""));
        remote.publish(UInt8MultiArray::from_bytes(b"two"));
        node.msg_callback(&UInt8MultiArray::from_bytes(b""));

        let path = node.file_path().unwrap();
        drop(node);
        assert_eq!(bus.subscriber_count("/raw_data_stream"), 0);
        assert_eq!(std::fs::read(path).unwrap(), b"one,two");
    }
}
