use std::path::{Path, PathBuf};

use argh::FromArgs;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

#[derive(FromArgs, Serialize, Deserialize, Debug, PartialEq)]
#[argh(subcommand, name = "device")]
/// Read the raw data stream from a serial receiver
pub struct DeviceCfg {
    /// serial device
    #[argh(positional)]
    pub serial_port: String,
    /// baud rate
    #[argh(option, default = "115200")]
    pub baud_rate: u32,
    /// timeout in milliseconds
    #[argh(option, default = "100")]
    pub timeout: u64,
    /// relay the published stream to TCP clients on this address
    #[argh(option)]
    pub relay: Option<String>,
    /// store this configuration as the default for `last`
    #[argh(switch)]
    #[serde(skip)]
    pub store: bool,
}

impl DeviceCfg {
    /// Store the configuration in the default location
    pub fn store_default(&self) -> Result<(), std::io::Error> {
        self.store_in(&get_default_path())
    }

    /// Load the configuration from the default location
    pub fn load_default() -> Result<Self, std::io::Error> {
        Self::load_from(&get_default_path())
    }

    /// Store the configuration as `config.json` inside `dir`
    pub fn store_in(&self, dir: &Path) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join("config.json"),
            serde_json::to_string(self)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?,
        )
    }

    /// Load the configuration from `config.json` inside `dir`
    pub fn load_from(dir: &Path) -> Result<Self, std::io::Error> {
        let data = std::fs::read(dir.join("config.json"))?;
        serde_json::from_slice(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

fn get_default_path() -> PathBuf {
    if let Some(path) = ProjectDirs::from("", "", "ublox_raw_recorder") {
        path.config_dir().to_path_buf()
    } else {
        PathBuf::from(".")
    }
}
