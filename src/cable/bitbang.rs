//! A cable for links that can only drive TMS/TCK/TDI and sample TDO, one signal change at a
//! time.  Every bit costs two link writes: TCK low with TMS and TDI set up, then TCK high.  TDO
//! is sampled in between, while the clock is low.
use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::Result;
use crate::link::SignalLink;

/// Signals whose level is inverted between the TAP and the link, for adapters with inverting
/// buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Invert {
    pub tms: bool,
    pub tck: bool,
    pub tdi: bool,
    pub tdo: bool,
}

pub struct BitBang<L: SignalLink> {
    link: L,
    divisor: u32,
    invert: Invert,
}

impl<L: SignalLink> BitBang<L> {
    /// Take over `link` and claim it.
    pub fn new(mut link: L) -> Result<Self> {
        link.open()?;
        Ok(Self { link, divisor: 1, invert: Invert::default() })
    }

    /// Repeat every signal write `divisor` times to slow TCK down.
    pub fn with_divisor(mut self, divisor: u32) -> Self {
        self.divisor = divisor.max(1);
        self
    }

    pub fn with_invert(mut self, invert: Invert) -> Self {
        self.invert = invert;
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn write(&mut self, tms: bool, tck: bool, tdi: bool) -> Result<()> {
        let inv = self.invert;
        for _ in 0..self.divisor {
            self.link.set_signal(tms ^ inv.tms, tck ^ inv.tck, tdi ^ inv.tdi)?;
        }
        Ok(())
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<bool> {
        self.write(tms, false, tdi)?;
        let tdo = self.link.get_signal()? ^ self.invert.tdo;
        self.write(tms, true, tdi)?;
        Ok(tdo)
    }
}

impl<L: SignalLink> Drop for BitBang<L> {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl<L: SignalLink> Cable for BitBang<L> {
    fn change_mode(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: bool) -> Result<()> {
        for bit in tms.iter().by_vals() {
            self.clock(bit, tdi)?;
        }
        Ok(())
    }

    fn read_write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        let mut out = BitVec::with_capacity(data.len());
        let last = data.len().saturating_sub(1);
        for (i, bit) in data.iter().by_vals().enumerate() {
            out.push(self.clock(exit_after && i == last, bit)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::sim::{SimPart, SimTarget};
    use crate::link::Link;
    use crate::statemachine::JtagState;

    #[test]
    fn opens_and_closes_link() {
        let target = SimTarget::new(alloc::vec![SimPart::new(4)]);
        let cable = BitBang::new(target.clone()).unwrap();
        assert!(target.is_open());
        drop(cable);
        assert!(!target.is_open());
    }

    #[test]
    fn divisor_repeats_writes_not_edges() {
        let target = SimTarget::new(alloc::vec![SimPart::new(4)]);
        let mut cable = BitBang::new(target.clone()).unwrap().with_divisor(4);
        cable.change_mode(bits![u8, Lsb0; 1, 1, 1, 1, 1, 0], true).unwrap();
        assert_eq!(target.clocks(), 6);
        assert_eq!(target.state(), JtagState::Idle);
    }

    #[test]
    fn exit_on_last_bit() {
        let target = SimTarget::new(alloc::vec![SimPart::new(4)]);
        let mut cable = BitBang::new(target.clone()).unwrap();
        // Reset, Idle, SelectDR, SelectIR, CaptureIR, ShiftIR
        cable.change_mode(bits![u8, Lsb0; 1, 1, 1, 1, 1, 0, 1, 1, 0, 0], true).unwrap();
        let out = cable.read_write_data(bits![u8, Lsb0; 1, 1, 1, 1], true).unwrap();
        assert_eq!(out, bits![u8, Lsb0; 1, 0, 0, 0]);
        assert_eq!(target.state(), JtagState::Exit1IR);
    }
}
