//! Memory access through a part's pins.  A bus driver knows how to run one bus cycle by
//! shifting boundary-scan vectors through the chain; [`BusContext`] turns byte ranges into
//! those cycles.
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::chain::Chain;
use crate::error::{Error, Result};

pub mod sram;

/// Byte order of a bus word in memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(rename_all = "lowercase"))]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn to_bytes(self, word: u32, unit_bytes: usize) -> Vec<u8> {
        let byte = |i: usize| (word >> (8 * i)) as u8;
        match self {
            Endian::Little => (0..unit_bytes).map(byte).collect(),
            Endian::Big => (0..unit_bytes).rev().map(byte).collect(),
        }
    }

    pub fn from_bytes(self, bytes: &[u8]) -> u32 {
        let n = bytes.len();
        bytes.iter().enumerate().fold(0, |acc, (i, &b)| {
            let shift = match self {
                Endian::Little => 8 * i,
                Endian::Big => 8 * (n - 1 - i),
            };
            acc | (u32::from(b) << shift)
        })
    }
}

/// Number of shifts spent in each phase of a bus cycle, and Run-Test/Idle clocks added after
/// the strobe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(serde::Deserialize))]
#[cfg_attr(feature = "std", serde(default))]
pub struct Timing {
    pub setup: usize,
    pub strobe: usize,
    pub hold: usize,
    pub idle_clocks: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self { setup: 1, strobe: 1, hold: 1, idle_clocks: 0 }
    }
}

/// How a bus is wired to the pins of one part.  Address and data signals are listed LSB first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusParams {
    pub part: usize,
    pub address: Vec<String>,
    pub data: Vec<String>,
    pub cs: String,
    pub oe: String,
    pub we: String,
    /// The strobes and chip select are asserted low.
    pub active_low: bool,
    pub endian: Endian,
    pub timing: Timing,
}

pub trait BusDriver {
    fn name(&self) -> &str;

    /// Index of the part whose pins carry the bus.
    fn part(&self) -> usize;

    /// Bytes per bus word, the unit of addressing.
    fn unit_bytes(&self) -> usize;

    fn address_width(&self) -> usize;

    fn endian(&self) -> Endian;

    /// Check that the part and the signals the driver uses exist.
    fn validate(&self, chain: &Chain) -> Result<()>;

    /// Get the part ready for bus cycles, before a run of reads or writes.
    fn prepare(&mut self, chain: &mut Chain) -> Result<()>;

    /// Read the word at bus address `address`.
    fn read(&mut self, chain: &mut Chain, address: u64) -> Result<u32>;

    fn write(&mut self, chain: &mut Chain, address: u64, word: u32) -> Result<()>;

    /// Leave the bus idle after a run of reads or writes.
    fn finish(&mut self, chain: &mut Chain) -> Result<()>;
}

/// Names accepted by [`new_from_string`].
pub fn names() -> &'static [&'static str] {
    &["sram"]
}

/// Look up a bus driver by name.
pub fn new_from_string(name: &str, params: BusParams) -> Result<Box<dyn BusDriver>> {
    match name {
        "sram" => Ok(Box::new(sram::Sram::new(params)?)),
        _ => Err(Error::Config(format!(
            "unknown bus driver `{name}` (available: {})",
            names().join(", ")
        ))),
    }
}

/// A bus driver bound to the chain it was validated against.
pub struct BusContext {
    driver: Box<dyn BusDriver>,
}

impl BusContext {
    pub fn new(driver: Box<dyn BusDriver>, chain: &Chain) -> Result<Self> {
        driver.validate(chain)?;
        log::info!(
            "{} bus on part {}: {} address lines, {} bit words",
            driver.name(),
            driver.part(),
            driver.address_width(),
            driver.unit_bytes() * 8
        );
        Ok(Self { driver })
    }

    pub fn driver(&self) -> &dyn BusDriver {
        self.driver.as_ref()
    }

    /// Word addresses covering `len` bytes from byte address `address`.
    fn units(&self, address: u64, len: usize) -> Result<core::ops::RangeInclusive<u64>> {
        let unit = self.driver.unit_bytes() as u64;
        let last_byte = address
            .checked_add(len as u64 - 1)
            .ok_or_else(|| Error::Syntax(format!("address 0x{address:x} + {len} overflows")))?;
        let (first, last) = (address / unit, last_byte / unit);
        let width = self.driver.address_width();
        if width < 64 && last >> width != 0 {
            return Err(Error::Syntax(format!(
                "address 0x{last_byte:x} is beyond the {width} address lines of the bus"
            )));
        }
        Ok(first..=last)
    }

    /// Read `len` bytes starting at byte address `address`.
    pub fn read_memory(&mut self, chain: &mut Chain, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| Error::OutOfMemory(len))?;
        if len == 0 {
            return Ok(out);
        }
        let units = self.units(address, len)?;
        let unit = self.driver.unit_bytes() as u64;
        let end = address + len as u64;

        log::debug!("read {len} bytes at 0x{address:x}");
        self.driver.prepare(chain)?;
        for u in units {
            let word = self.driver.read(chain, u)?;
            let bytes = self.driver.endian().to_bytes(word, unit as usize);
            for (i, b) in bytes.into_iter().enumerate() {
                let at = u * unit + i as u64;
                if (address..end).contains(&at) {
                    out.push(b);
                }
            }
        }
        self.driver.finish(chain)?;
        Ok(out)
    }

    /// Write `data` starting at byte address `address`.  Words only partly covered are read
    /// first and merged.
    pub fn write_memory(&mut self, chain: &mut Chain, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let units = self.units(address, data.len())?;
        let unit = self.driver.unit_bytes() as u64;
        let end = address + data.len() as u64;
        let endian = self.driver.endian();

        log::debug!("write {} bytes at 0x{address:x}", data.len());
        self.driver.prepare(chain)?;
        for u in units {
            let start = u * unit;
            let word = if start >= address && start + unit <= end {
                let offset = (start - address) as usize;
                endian.from_bytes(&data[offset..offset + unit as usize])
            } else {
                let old = self.driver.read(chain, u)?;
                let mut bytes = endian.to_bytes(old, unit as usize);
                for (i, b) in bytes.iter_mut().enumerate() {
                    let at = start + i as u64;
                    if (address..end).contains(&at) {
                        *b = data[(at - address) as usize];
                    }
                }
                log::trace!("merged word at 0x{u:x}: {old:08x}");
                endian.from_bytes(&bytes)
            };
            self.driver.write(chain, u, word)?;
        }
        self.driver.finish(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endian_bytes() {
        assert_eq!(Endian::Little.to_bytes(0x1234, 2), [0x34, 0x12]);
        assert_eq!(Endian::Big.to_bytes(0x1234, 2), [0x12, 0x34]);
        assert_eq!(Endian::Big.from_bytes(&[0x12, 0x34, 0x56, 0x78]), 0x1234_5678);
        assert_eq!(Endian::Little.from_bytes(&[0x78, 0x56]), 0x5678);
    }

    #[test]
    fn unknown_driver() {
        let params = BusParams {
            part: 0,
            address: Vec::new(),
            data: Vec::new(),
            cs: "CS".into(),
            oe: "OE".into(),
            we: "WE".into(),
            active_low: true,
            endian: Endian::Little,
            timing: Timing::default(),
        };
        let err = new_from_string("flash", params).err().map(|e| e.kind());
        assert_eq!(err, Some(crate::error::ErrorKind::Config));
    }
}
