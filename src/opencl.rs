// OpenCL device discovery
use ocl::{Device, Platform};

use crate::lbm::{LbmError, Result};

/// Returns the device with the highest clock frequency times compute units across all platforms,
/// together with the platform it belongs to.
pub fn device_selection() -> Result<(Platform, Device)> {
    let devices = get_devices()?;
    log::info!("{} OpenCL device(s) detected", devices.len());
    let mut best: Option<(u64, Platform, Device)> = None;
    for (platform, device) in devices {
        let value = get_flops(device)?;
        if best.map_or(true, |(b, _, _)| value > b) {
            best = Some((value, platform, device));
        }
    }
    let (_, platform, device) =
        best.ok_or_else(|| LbmError::Device("no OpenCL device available".to_owned()))?;
    log::info!("Using \"{}\"", device.name()?);
    Ok((platform, device))
}

/// Every device of every platform, paired with its platform.
pub fn get_devices() -> Result<Vec<(Platform, Device)>> {
    let mut devices = Vec::new();
    for platform in Platform::list() {
        devices.extend(Device::list_all(platform)?.into_iter().map(|device| (platform, device)));
    }
    Ok(devices)
}

fn get_flops(device: Device) -> Result<u64> {
    let parse = |info: ocl::enums::DeviceInfo| -> Result<u64> {
        device
            .info(info)?
            .to_string()
            .parse()
            .map_err(|e| LbmError::Device(format!("cannot parse device info: {e}")))
    };
    Ok(parse(ocl::enums::DeviceInfo::MaxClockFrequency)? * parse(ocl::enums::DeviceInfo::MaxComputeUnits)?)
}
