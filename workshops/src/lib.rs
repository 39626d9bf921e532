use candle_core::Device;
use color_eyre::{Report, Result};
use engine::{
    ModelError,
    config::{Config, load_config},
    device::{device_name, select_device},
    hub::Hub,
};

use crate::cli::Common;

pub mod cli;
pub mod images;
pub mod similarity;
pub mod speech;
pub mod text;

/// What every program sets up before loading its model.
pub struct Session {
    pub config: Config,
    pub device: Device,
    pub hub: Hub,
}

impl Session {
    pub fn start(common: &Common) -> Result<Self> {
        let mut config = load_config()?;
        if let Some(device) = common.device {
            config.device = device;
        }
        if common.seed.is_some() {
            config.seed = common.seed;
        }
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let device = select_device(config.device)?;
        println!("Using device: {}", device_name(&device));
        let hub = Hub::new(&config)?;
        Ok(Self {
            config,
            device,
            hub,
        })
    }
}

/// Lines a program prints when it gives up. A missing model file gets a
/// short hint, anything else the full report.
pub fn describe_failure(report: &Report) -> Vec<String> {
    let not_found = report
        .chain()
        .find_map(|e| e.downcast_ref::<ModelError>())
        .filter(|e| matches!(e, ModelError::NotFound(_)));

    match not_found {
        Some(err) => vec![
            format!("Error: {err}"),
            "Please check the model path argument.".to_string(),
        ],
        None => vec![
            format!("An error occurred: {report}"),
            format!("{report:?}"),
        ],
    }
}
