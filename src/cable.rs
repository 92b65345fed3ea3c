//! Implementations for different JTAG hardware adapters live here.  Hardware adapters should
//! implement the `Cable` trait.  Adapters that only know how to wiggle pins are built from a
//! [`SignalLink`](crate::link::SignalLink) and the generic [`bitbang::BitBang`] cable; adapters
//! with their own shift engine implement `Cable` directly on top of their link.
//!
//! Bit vectors are always in clock order: index 0 is the first bit presented on TDI, and the
//! first bit sampled from TDO.
use bitvec::prelude::*;

use crate::error::Result;

pub mod bitbang;
#[cfg(feature = "std")]
pub mod jlink;
#[cfg(feature = "ftd2xx")]
pub mod mpsse;
#[cfg(feature = "std")]
pub mod usbblaster;

pub trait Cable {
    /// Clock out a series of TMS values to change the state of the JTAG chain.  TDI is held at
    /// `tdi` for the whole sequence.
    fn change_mode(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: bool) -> Result<()>;

    /// Shift `data` out on TDI while sampling TDO, one bit per clock.  Should be called with
    /// state = ShiftIR or ShiftDR.  The state doesn't change unless `exit_after` is true, in
    /// which case the last bit is clocked with TMS high and the chain ends up in Exit1IR or
    /// Exit1DR.
    fn read_write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>>;

    /// Like `read_write_data`, for callers that don't care about TDO.
    fn write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<()> {
        self.read_write_data(data, exit_after).map(|_| ())
    }

    /// Shift in `bits` bits from TDO while clocking out all ones.
    fn read_data(&mut self, bits: usize, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        let ones = bitvec![u8, Lsb0; 1; bits];
        self.read_write_data(&ones, exit_after)
    }

    /// Push out anything the cable has buffered.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Settings handed to a cable constructor looked up by name.
#[cfg(feature = "std")]
#[derive(Clone, Debug, Default)]
pub struct CableParams {
    /// USB match criteria.  Unset ids fall back to the adapter's defaults.
    pub usb: crate::link::usbconn::UsbMatch,
    /// TCK frequency in hertz, for adapters with a programmable clock.
    pub frequency: Option<u32>,
}

/// Cable drivers a session file can name.  `sim` is built by the session file itself, from
/// its part list, rather than by [`new_from_string`].
#[cfg(feature = "std")]
pub fn names() -> &'static [&'static str] {
    if cfg!(feature = "ftd2xx") {
        &["usbblaster", "jlink", "jtagkey", "sim"]
    } else {
        &["usbblaster", "jlink", "sim"]
    }
}

/// Look up a cable driver by name, connect to the matching adapter and open it.
#[cfg(feature = "std")]
pub fn new_from_string(name: &str, params: &CableParams) -> Result<alloc::boxed::Box<dyn Cable>> {
    use alloc::boxed::Box;
    use crate::error::Error;

    log::debug!("opening cable driver {name}");
    match name {
        "usbblaster" => Ok(Box::new(usbblaster::UsbBlaster::connect(&params.usb)?)),
        "jlink" => Ok(Box::new(jlink::JLink::connect(&params.usb, params.frequency.unwrap_or(1_000_000))?)),
        #[cfg(feature = "ftd2xx")]
        "jtagkey" => Ok(Box::new(mpsse::JtagKey::new(params.frequency.unwrap_or(1 << 20), true)?)),
        #[cfg(not(feature = "ftd2xx"))]
        "jtagkey" => Err(Error::Config(alloc::format!("cable `{name}` needs the ftd2xx feature"))),
        "sim" => Err(Error::Config("the sim cable needs the parts of a session file".into())),
        _ => Err(Error::Config(alloc::format!(
            "unknown cable driver `{name}` (available: {})",
            names().join(", ")
        ))),
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn driver_names() {
        assert!(names().contains(&"sim"));
        assert_eq!(names().contains(&"jtagkey"), cfg!(feature = "ftd2xx"));

        let params = CableParams::default();
        let kind = |name| new_from_string(name, &params).err().map(|e| e.kind());
        assert_eq!(kind("sim"), Some(ErrorKind::Config));
        let err = new_from_string("xpc", &params).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("available: usbblaster, jlink"), "{err}");
    }
}
