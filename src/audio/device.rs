//! Capture device selection and validation

use cpal::traits::{DeviceTrait, HostTrait};

use crate::constants::CHANNELS;
use crate::error::AudioError;

/// Summary of the selected input device, for startup logging
#[derive(Debug, Clone)]
pub struct InputSummary {
    pub name: String,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Find an input device by exact name, or the default input device.
pub fn find_input(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    match name {
        Some(wanted) => {
            let devices = host
                .input_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

            for device in devices {
                if let Ok(name) = device.name() {
                    if name == wanted {
                        return Ok(device);
                    }
                }
            }

            Err(AudioError::DeviceNotFound(wanted.to_string()))
        }
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
    }
}

/// Validate that the device can feed the broadcast pipeline.
///
/// The device must offer at least as many input channels as the stream is
/// configured for; a mono microphone cannot fill a stereo frame.
pub fn validate_input(device: &cpal::Device) -> Result<InputSummary, AudioError> {
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    let max_channels = configs.map(|c| c.channels()).max().unwrap_or(0);
    if max_channels < CHANNELS {
        return Err(AudioError::UnsupportedFormat(format!(
            "device '{}' offers {} input channel(s), need {}",
            name, max_channels, CHANNELS
        )));
    }

    let default_config = device
        .default_input_config()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    Ok(InputSummary {
        name,
        channels: max_channels,
        sample_rate: default_config.sample_rate().0,
    })
}
