//! Everything one user drives at a time: a chain behind a cable, and optionally a bus bound to
//! one of its parts.  Commands get the session passed in instead of reaching for globals.
use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::bus::{BusContext, BusDriver};
use crate::cable::Cable;
use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::part::Part;

#[derive(Default)]
pub struct Session {
    chain: Option<Chain>,
    bus: Option<BusContext>,
}

fn no_chain() -> Error {
    Error::IllegalState("no cable attached".into())
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a new, empty chain behind `cable`.  Any previous chain and bus are dropped.
    pub fn attach_cable(&mut self, cable: Box<dyn Cable>) {
        self.attach_chain(Chain::from_cable(cable));
    }

    pub fn attach_chain(&mut self, chain: Chain) {
        self.detach();
        self.chain = Some(chain);
    }

    /// Drop the bus, then the chain and its cable.
    pub fn detach(&mut self) {
        self.bus = None;
        self.chain = None;
    }

    pub fn chain(&self) -> Result<&Chain> {
        self.chain.as_ref().ok_or_else(no_chain)
    }

    pub fn chain_mut(&mut self) -> Result<&mut Chain> {
        self.chain.as_mut().ok_or_else(no_chain)
    }

    pub fn add_part(&mut self, part: Part) -> Result<()> {
        self.chain_mut()?.add_part(part);
        Ok(())
    }

    /// Bind `driver` to the chain.  The driver is checked against the chain first.
    pub fn attach_bus(&mut self, driver: Box<dyn BusDriver>) -> Result<()> {
        let bus = BusContext::new(driver, self.chain()?)?;
        self.bus = Some(bus);
        Ok(())
    }

    pub fn detach_bus(&mut self) {
        self.bus = None;
    }

    pub fn bus(&self) -> Option<&BusContext> {
        self.bus.as_ref()
    }

    /// Reset the chain and go to Run-Test/Idle.
    pub fn reset(&mut self) -> Result<()> {
        self.chain_mut()?.reset()
    }

    fn bus_and_chain(&mut self) -> Result<(&mut BusContext, &mut Chain)> {
        let bus = self.bus.as_mut().ok_or_else(|| Error::IllegalState("Bus missing".into()))?;
        let chain = self.chain.as_mut().ok_or_else(no_chain)?;
        Ok((bus, chain))
    }

    pub fn read_memory(&mut self, address: u64, len: usize) -> Result<Vec<u8>> {
        let (bus, chain) = self.bus_and_chain()?;
        bus.read_memory(chain, address, len)
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let (bus, chain) = self.bus_and_chain()?;
        bus.write_memory(chain, address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::bitbang::BitBang;
    use crate::error::ErrorKind;
    use crate::link::sim::{SimPart, SimTarget};
    use alloc::string::ToString;

    #[test]
    fn memory_needs_a_bus() {
        let mut session = Session::new();
        assert_eq!(session.reset().unwrap_err().kind(), ErrorKind::IllegalState);

        let target = SimTarget::new(alloc::vec![SimPart::new(4)]);
        session.attach_cable(Box::new(BitBang::new(target.clone()).unwrap()));
        session.add_part(Part::new("cpu", 4).unwrap()).unwrap();
        session.reset().unwrap();

        let err = session.read_memory(0x100, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(err.to_string(), "Bus missing");
        assert_eq!(session.write_memory(0, &[1]).unwrap_err().kind(), ErrorKind::IllegalState);
        // Nothing was clocked for the refused calls
        assert_eq!(target.clocks(), 6);
    }

    #[test]
    fn detach_drops_the_cable() {
        let target = SimTarget::new(alloc::vec![SimPart::new(4)]);
        let mut session = Session::new();
        session.attach_cable(Box::new(BitBang::new(target.clone()).unwrap()));
        assert!(crate::link::Link::is_open(&target));
        session.detach();
        assert!(!crate::link::Link::is_open(&target));
        assert!(session.chain().is_err());
    }
}
