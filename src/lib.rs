#![deny(missing_docs)]
//! # UBX raw data stream
//! Logs the raw byte stream of a u-blox receiver to a timestamped file and/or
//! republishes it on a publish/subscribe bus, for later replay and
//! post-processing (e.g. with RTKLIB).
//!
//! The bytes are opaque: nothing here parses the receiver protocol. Data can
//! come straight from the device ([`SourceMode::Device`]) or from the bus,
//! possibly relayed over the network from another process
//! ([`SourceMode::Subscriber`]).
mod bus;
mod device;
mod file_sink;
mod msg;
mod params;
mod raw_data;
mod relay;

pub use bus::{resolve_topic, Bus, BusError, Publisher, Subscription};
pub use device::{run_reader, DeviceError, SerialSource};
pub use file_sink::{log_file_name, FileSink, FileSinkError};
pub use msg::{MultiArrayDimension, MultiArrayLayout, UInt8MultiArray, RAW_DATA_LABEL};
pub use params::{FromParam, ParamError, ParamStore, ParamValue};
pub use raw_data::{
    RawDataError, RawDataStream, SourceMode, NODE_NAME, PARAM_DIR, PARAM_STREAM_DIR,
    PARAM_STREAM_PUBLISH, QUEUE_DEPTH, RAW_DATA_TOPIC,
};
pub use relay::{read_frame, write_frame, RelayClient, RelayError, RelayServer, MAX_FRAME_LEN};
