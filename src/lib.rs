//! This crate drives an IEEE 1149.1 (JTAG) test chain at a variety of levels of abstraction.
//!
//! At the bottom, a link moves raw bytes or pin levels to the hardware: a USB device, GPIO
//! pins through `embedded-hal`, or the simulated chain in [`link::sim`].  A [`cable::Cable`]
//! sits on a link and knows how to clock TMS sequences and shift bits through TDI/TDO.  The
//! USB-Blaster, J-Link and FT2232 "jtagkey" adapters implement `Cable` directly; anything that
//! can only wiggle pins goes through [`cable::bitbang::BitBang`].
//!
//! [`statemachine::JtagSM`] keeps track of the TAP state.  You tell it which stable state you
//! want (e.g., Reset or Idle) and it gets there with the fewest TMS clocks.  It also scans raw
//! instruction and data registers.  A transfer error leaves the state unknown, and only a
//! reset gets it back.
//!
//! A [`chain::Chain`] knows the parts on the chain, the instruction each one holds and the
//! data register it selects.  It builds the chain-wide vectors for instruction and data scans
//! and splits the captures back up per part.  Part 0 is the part nearest TDO, so its bits are
//! clocked first.  The chain can also be discovered with [`chain::Chain::detect`].
//!
//! Finally, a [`bus::BusDriver`] runs memory cycles through the boundary register of one part,
//! and [`bus::BusContext`] turns byte ranges into those cycles.
//!
//! # Example
//! ```
//! use jtag_chain::cable::bitbang::BitBang;
//! use jtag_chain::chain::Chain;
//! use jtag_chain::link::sim::{SimPart, SimTarget};
//! let target = SimTarget::new(vec![SimPart::new(4).with_idcode(0x4ba0_0477), SimPart::new(8)]);
//! let cable = BitBang::new(target).unwrap();
//! let mut chain = Chain::from_cable(Box::new(cable));
//! chain.detect().unwrap();
//!
//! assert_eq!(chain.parts()[0].idcode(), Some(0x4ba0_0477));
//! assert_eq!(chain.parts()[1].instruction_length(), 8);
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod bus;
pub mod cable;
pub mod chain;
#[cfg(feature = "std")]
pub mod cmd;
#[cfg(feature = "std")]
pub mod config;
pub mod error;
pub mod link;
pub mod part;
pub mod session;
pub mod statemachine;
