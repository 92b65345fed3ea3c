//! An asynchronous SRAM-style bus: address lines, data lines, chip select, output enable and
//! write enable, all on the boundary register of one part running EXTEST.
//!
//! A read is `AddrSetup` (chip selected, address driven), `Strobe` (output enable asserted),
//! then `DataCapture`, a shift that releases the strobe and whose capture holds the data the
//! memory drove during the strobe.  A write drives address and data in `AddrSetup`, pulses
//! write enable in `Strobe`, and keeps the data valid through `Hold`.  `finish` returns the
//! bus to `Idle` with the chip deselected and the data lines released.
use alloc::format;
use alloc::vec::Vec;

use crate::bus::{BusDriver, BusParams, Endian};
use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::part::{Part, EXTEST, SAMPLE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusPhase {
    Idle,
    AddrSetup,
    Strobe,
    DataCapture,
    Hold,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

pub struct Sram {
    params: BusParams,
    phase: BusPhase,
}

impl Sram {
    pub fn new(params: BusParams) -> Result<Self> {
        match params.data.len() {
            8 | 16 | 32 => {}
            n => return Err(Error::Config(format!("SRAM bus needs 8, 16 or 32 data lines, not {n}"))),
        }
        if params.address.is_empty() || params.address.len() > 32 {
            return Err(Error::Config(format!(
                "SRAM bus needs 1 to 32 address lines, not {}",
                params.address.len()
            )));
        }
        if params.timing.strobe == 0 {
            return Err(Error::Config("SRAM strobe must last at least one shift".into()));
        }
        Ok(Self { params, phase: BusPhase::Idle })
    }

    pub fn phase(&self) -> BusPhase {
        self.phase
    }

    fn signal_names(&self) -> impl Iterator<Item = &str> {
        self.params
            .address
            .iter()
            .chain(&self.params.data)
            .chain([&self.params.cs, &self.params.oe, &self.params.we])
            .map(|s| s.as_str())
    }

    /// Set up the boundary register of the bus part for `phase`.
    fn drive(&self, part: &mut Part, phase: BusPhase, access: Access, address: u64, data: Option<u32>) -> Result<()> {
        let on = !self.params.active_low;
        let cs = phase != BusPhase::Idle;
        let oe = phase == BusPhase::Strobe && access == Access::Read;
        let we = phase == BusPhase::Strobe && access == Access::Write;
        part.set_signal(&self.params.cs, true, if cs { on } else { !on })?;
        part.set_signal(&self.params.oe, true, if oe { on } else { !on })?;
        part.set_signal(&self.params.we, true, if we { on } else { !on })?;

        for (i, name) in self.params.address.iter().enumerate() {
            part.set_signal(name, true, (address >> i) & 1 == 1)?;
        }
        for (i, name) in self.params.data.iter().enumerate() {
            match data {
                Some(word) if phase != BusPhase::Idle => part.set_signal(name, true, (word >> i) & 1 == 1)?,
                _ => part.set_signal(name, false, false)?,
            }
        }
        Ok(())
    }

    /// Enter `phase` and hold it for `shifts` data scans.
    fn cycle(&mut self, chain: &mut Chain, phase: BusPhase, access: Access, address: u64, data: Option<u32>, shifts: usize) -> Result<()> {
        log::trace!("{:?} -> {phase:?} at 0x{address:x}", self.phase);
        self.drive(chain.part_mut(self.params.part)?, phase, access, address, data)?;
        for _ in 0..shifts {
            chain.shift_data_registers()?;
        }
        self.phase = phase;
        Ok(())
    }

    fn strobe(&mut self, chain: &mut Chain, access: Access, address: u64, data: Option<u32>) -> Result<()> {
        let timing = self.params.timing;
        self.cycle(chain, BusPhase::Strobe, access, address, data, timing.strobe)?;
        if timing.idle_clocks > 0 {
            chain.idle(timing.idle_clocks)?;
        }
        Ok(())
    }
}

impl BusDriver for Sram {
    fn name(&self) -> &str {
        "sram"
    }

    fn part(&self) -> usize {
        self.params.part
    }

    fn unit_bytes(&self) -> usize {
        self.params.data.len() / 8
    }

    fn address_width(&self) -> usize {
        self.params.address.len()
    }

    fn endian(&self) -> Endian {
        self.params.endian
    }

    fn validate(&self, chain: &Chain) -> Result<()> {
        let part = chain.part(self.params.part)?;
        if part.instruction(EXTEST).is_none() {
            return Err(Error::Config(format!("part `{}` has no {EXTEST} instruction", part.name())));
        }
        let missing: Vec<&str> = self.signal_names().filter(|s| part.signal(s).is_err()).collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "part `{}` lacks bus signals: {}",
                part.name(),
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn prepare(&mut self, chain: &mut Chain) -> Result<()> {
        let index = self.params.part;
        let part = chain.part(index)?;
        if part.active_instruction().map(|i| i.name()) == Some(EXTEST) {
            return Ok(());
        }

        // Preload an idle bus so EXTEST doesn't start out driving garbage
        let preload = part.instruction(SAMPLE).is_some();
        self.drive(chain.part_mut(index)?, BusPhase::Idle, Access::Read, 0, None)?;
        if preload {
            chain.select_instruction(index, SAMPLE)?;
            chain.shift_data_registers()?;
        }
        chain.select_instruction(index, EXTEST)?;
        self.cycle(chain, BusPhase::Idle, Access::Read, 0, None, 1)
    }

    fn read(&mut self, chain: &mut Chain, address: u64) -> Result<u32> {
        let timing = self.params.timing;
        self.cycle(chain, BusPhase::AddrSetup, Access::Read, address, None, timing.setup)?;
        self.strobe(chain, Access::Read, address, None)?;
        self.cycle(chain, BusPhase::DataCapture, Access::Read, address, None, 1)?;

        let part = chain.part(self.params.part)?;
        let mut word = 0u32;
        for (i, name) in self.params.data.iter().enumerate() {
            if part.get_signal(name)? {
                word |= 1 << i;
            }
        }
        log::trace!("read 0x{address:x}: {word:08x}");
        Ok(word)
    }

    fn write(&mut self, chain: &mut Chain, address: u64, word: u32) -> Result<()> {
        let timing = self.params.timing;
        log::trace!("write 0x{address:x}: {word:08x}");
        self.cycle(chain, BusPhase::AddrSetup, Access::Write, address, Some(word), timing.setup)?;
        self.strobe(chain, Access::Write, address, Some(word))?;
        self.cycle(chain, BusPhase::Hold, Access::Write, address, Some(word), timing.hold)
    }

    fn finish(&mut self, chain: &mut Chain) -> Result<()> {
        self.cycle(chain, BusPhase::Idle, Access::Read, 0, None, 1)
    }
}
