//! USB connections through libusb.  Cables that speak a bulk or control protocol sit on top of
//! a [`UsbConn`] instead of talking to `rusb` themselves.
use std::time::Duration;
use std::format;
use std::string::String;
use std::vec::Vec;

use rusb::{Device, DeviceDescriptor, DeviceHandle, GlobalContext};

use crate::error::{Error, Result};
use crate::link::Link;

/// Criteria picking one device out of the bus.  `None` ids match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsbMatch {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// Substring looked for in the manufacturer, product and serial number strings, in that
    /// order.  Case sensitive.
    pub desc: Option<String>,
}

impl UsbMatch {
    pub fn new(vid: u16, pid: u16) -> Self {
        Self { vid: Some(vid), pid: Some(pid), desc: None }
    }

    /// Fill in ids the user left open with a cable's defaults.
    pub fn or_defaults(&self, vid: u16, pid: u16) -> Self {
        Self {
            vid: self.vid.or(Some(vid)),
            pid: self.pid.or(Some(pid)),
            desc: self.desc.clone(),
        }
    }

    pub fn matches_ids(&self, vid: u16, pid: u16) -> bool {
        self.vid.map_or(true, |v| v == vid) && self.pid.map_or(true, |p| p == pid)
    }

    /// Any one of the strings containing the descriptor is a match.  Strings the device could
    /// not report are passed as `None` and never match.
    pub fn matches_strings(&self, manufacturer: Option<&str>, product: Option<&str>, serial: Option<&str>) -> bool {
        let Some(desc) = self.desc.as_deref() else {
            return true;
        };
        [manufacturer, product, serial]
            .into_iter()
            .flatten()
            .any(|s| s.contains(desc))
    }
}

pub struct UsbConn {
    device: Device<GlobalContext>,
    handle: Option<DeviceHandle<GlobalContext>>,
    interface: u8,
    timeout: Duration,
}

fn strings_match(device: &Device<GlobalContext>, desc: &DeviceDescriptor, criteria: &UsbMatch) -> bool {
    if criteria.desc.is_none() {
        return true;
    }
    let handle = match device.open() {
        Ok(h) => h,
        Err(e) => {
            log::debug!("cannot open bus {} device {} to read strings: {e}", device.bus_number(), device.address());
            return false;
        }
    };
    let manufacturer = handle.read_manufacturer_string_ascii(desc).ok();
    let product = handle.read_product_string_ascii(desc).ok();
    let serial = handle.read_serial_number_string_ascii(desc).ok();
    criteria.matches_strings(manufacturer.as_deref(), product.as_deref(), serial.as_deref())
}

impl UsbConn {
    /// Find the first device, bus by bus and then by address, that satisfies `criteria`.  The
    /// device is not claimed until [`Link::open`].
    pub fn connect(criteria: &UsbMatch) -> Result<Self> {
        let mut devices: Vec<_> = rusb::devices()
            .map_err(|e| Error::NotFound(format!("USB enumeration failed: {e}")))?
            .iter()
            .collect();
        devices.sort_by_key(|d| (d.bus_number(), d.address()));

        for device in devices {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if !criteria.matches_ids(desc.vendor_id(), desc.product_id()) {
                continue;
            }
            if strings_match(&device, &desc, criteria) {
                log::info!(
                    "found USB device {:04x}:{:04x} on bus {} device {}",
                    desc.vendor_id(),
                    desc.product_id(),
                    device.bus_number(),
                    device.address()
                );
                return Ok(Self {
                    device,
                    handle: None,
                    interface: 0,
                    timeout: Duration::from_millis(100),
                });
            }
        }
        Err(Error::NotFound("no USB connections".into()))
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device(&self) -> &Device<GlobalContext> {
        &self.device
    }

    pub fn handle(&self) -> Result<&DeviceHandle<GlobalContext>> {
        self.handle.as_ref().ok_or_else(|| Error::IllegalState("USB connection is not open".into()))
    }

    pub fn write_bulk(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
        Ok(self.handle()?.write_bulk(endpoint, data, self.timeout)?)
    }

    pub fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
        Ok(self.handle()?.read_bulk(endpoint, buf, self.timeout)?)
    }

    /// Write all of `data`, splitting it over as many transfers as the device asks for.
    pub fn write_all(&self, endpoint: u8, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.write_bulk(endpoint, data)?;
            if n == 0 {
                return Err(Error::Transport("USB bulk write made no progress".into()));
            }
            data = &data[n..];
        }
        Ok(())
    }

    pub fn write_control(&self, request_type: u8, request: u8, value: u16, index: u16, data: &[u8]) -> Result<usize> {
        Ok(self.handle()?.write_control(request_type, request, value, index, data, self.timeout)?)
    }
}

impl Link for UsbConn {
    fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.device.open()?;
        if let Ok(config) = self.device.config_descriptor(0) {
            if let Err(e) = handle.set_active_configuration(config.number()) {
                log::debug!("set configuration: {e}");
            }
        }
        handle
            .claim_interface(self.interface)
            .map_err(|e| Error::from(e).context("claim interface"))?;
        if let Err(e) = handle.set_alternate_setting(self.interface, 0) {
            log::debug!("set alternate setting: {e}");
        }
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.release_interface(self.interface);
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for UsbConn {
    fn drop(&mut self) {
        self.close();
    }
}
