use candle_core::{
    DType, Device,
    utils::{cuda_is_available, metal_is_available},
};
use color_eyre::Result;
use log::info;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

use crate::ModelError;

#[derive(
    Debug,
    Clone,
    Copy,
    Display,
    clap::ValueEnum,
    Serialize,
    Deserialize,
    Hash,
    PartialEq,
    Eq,
    EnumIter,
    Default,
)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

pub fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => {
            if !cuda_is_available() {
                return Err(ModelError::UnsupportedDevice("cuda".into()).into());
            }
            Device::new_cuda(0)?
        }
        DevicePreference::Metal => {
            if !metal_is_available() {
                return Err(ModelError::UnsupportedDevice("metal".into()).into());
            }
            Device::new_metal(0)?
        }
        DevicePreference::Auto => {
            if cuda_is_available() {
                Device::new_cuda(0)?
            } else if metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };

    info!("Selected {} for {preference} preference", device_name(&device));
    Ok(device)
}

/// Half precision only pays off on CUDA, everything else runs in f32.
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "mps",
    }
}
