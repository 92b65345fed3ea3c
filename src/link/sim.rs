//! A scan chain that only exists in software.  `SimTarget` implements [`SignalLink`], so it can
//! stand in for a real adapter wherever a bit-bang cable is accepted: in tests, and as the `sim`
//! cable for dry runs of a configuration.
//!
//! Every simulated part has an instruction register with the standard `...01` capture pattern,
//! BYPASS, an optional IDCODE, plain data registers that read back their last update, and a
//! boundary register.  Under an EXTEST-style instruction the boundary register drives the part's
//! pins, and an asynchronous SRAM can be hung off those pins.
//!
//! Parts are listed in chain order: part 0 drives TDO, the last part receives TDI.
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use bitvec::prelude::*;

use crate::bus::BusParams;
use crate::error::{Error, Result};
use crate::link::{Link, SignalLink};
use crate::part::{self, Part, Signal};
use crate::statemachine::JtagState;

/// What an instruction connects between TDI and TDO.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimRegister {
    Bypass,
    IdCode,
    /// The boundary register.  With `drive` set the update latch controls the pins (EXTEST),
    /// otherwise the pins are left to the core and only the latch is loaded (SAMPLE/PRELOAD).
    Boundary { drive: bool },
    /// Index of a register added with [`SimPart::with_register`].
    User(usize),
}

#[derive(Clone, Debug)]
pub struct SimInstruction {
    /// Opcode in shift order, LSB first.
    pub code: BitVec<u8, Lsb0>,
    pub register: SimRegister,
}

/// Boundary cells belonging to one pin.  `control` is the enable cell and the value that
/// disables the output driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimPin {
    pub input: Option<usize>,
    pub output: Option<usize>,
    pub control: Option<(usize, bool)>,
}

impl From<&Signal> for SimPin {
    fn from(signal: &Signal) -> Self {
        Self {
            input: signal.input,
            output: signal.output,
            control: signal.control.map(|c| (c.cell, c.disable)),
        }
    }
}

/// An asynchronous SRAM wired to a part's pins.  A word is as wide as `data`, and addresses
/// wrap around the size of `words`.
#[derive(Clone, Debug)]
pub struct SimMemory {
    pub words: Vec<u32>,
    pub address: Vec<SimPin>,
    pub data: Vec<SimPin>,
    pub cs: SimPin,
    pub oe: SimPin,
    pub we: SimPin,
    pub active_low: bool,
}

impl SimMemory {
    /// A memory of `words` words filled with `fill`, wired to `part` the way `bus` says.
    pub fn wired(part: &Part, bus: &BusParams, words: usize, fill: u32) -> Result<Self> {
        let pin = |name: &str| part.signal(name).map(SimPin::from);
        let pins = |names: &[alloc::string::String]| names.iter().map(|n| pin(n.as_str())).collect::<Result<Vec<_>>>();
        Ok(Self {
            words: alloc::vec![fill; words],
            address: pins(&bus.address)?,
            data: pins(&bus.data)?,
            cs: pin(bus.cs.as_str())?,
            oe: pin(bus.oe.as_str())?,
            we: pin(bus.we.as_str())?,
            active_low: bus.active_low,
        })
    }
}

#[derive(Clone, Debug)]
pub struct SimPart {
    ir_len: usize,
    idcode: Option<u32>,
    instructions: Vec<SimInstruction>,
    registers: Vec<BitVec<u8, Lsb0>>,
    boundary: BitVec<u8, Lsb0>,
    memory: Option<SimMemory>,

    selected: SimRegister,
    latched_ir: Option<BitVec<u8, Lsb0>>,
    shift: BitVec<u8, Lsb0>,
}

fn opcode(value: u64, len: usize) -> BitVec<u8, Lsb0> {
    (0..len).map(|i| i < 64 && (value >> i) & 1 == 1).collect()
}

impl SimPart {
    /// A part with an `ir_len` bit instruction register that only knows BYPASS (all ones).
    pub fn new(ir_len: usize) -> Self {
        Self {
            ir_len,
            idcode: None,
            instructions: alloc::vec![SimInstruction {
                code: bitvec![u8, Lsb0; 1; ir_len],
                register: SimRegister::Bypass,
            }],
            registers: Vec::new(),
            boundary: BitVec::new(),
            memory: None,
            selected: SimRegister::Bypass,
            latched_ir: None,
            shift: BitVec::new(),
        }
    }

    /// Give the part an IDCODE, selected by Test-Logic-Reset.
    pub fn with_idcode(mut self, idcode: u32) -> Self {
        self.idcode = Some(idcode);
        self.selected = SimRegister::IdCode;
        self
    }

    /// Map `code` (shift order) to `register`.  A later mapping of the same code wins.
    pub fn with_instruction(mut self, code: &BitSlice<u8, Lsb0>, register: SimRegister) -> Self {
        self.instructions.push(SimInstruction { code: code.to_bitvec(), register });
        self
    }

    pub fn with_opcode(self, code: u64, register: SimRegister) -> Self {
        let bits = opcode(code, self.ir_len);
        self.with_instruction(&bits, register)
    }

    /// Add a data register of `len` bits, reachable as `SimRegister::User(n)` where `n` counts
    /// earlier calls.
    pub fn with_register(mut self, len: usize) -> Self {
        self.registers.push(bitvec![u8, Lsb0; 0; len]);
        self
    }

    pub fn with_boundary(mut self, len: usize) -> Self {
        self.boundary = bitvec![u8, Lsb0; 0; len];
        self
    }

    pub fn with_memory(mut self, memory: SimMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Model `part` in hardware: every instruction it defines, connected to a register of the
    /// same length.  Boundary instructions drive the pins unless they are SAMPLE or PRELOAD.
    pub fn from_part(part: &Part) -> Self {
        let mut sim = SimPart::new(part.instruction_length());
        if let Some(idcode) = part.idcode() {
            sim = sim.with_idcode(idcode);
        }
        let boundary = part.boundary_register().map(|r| r.name());
        if let Some(bsr) = part.boundary_register() {
            sim = sim.with_boundary(bsr.len());
        }

        let mut users = Vec::new();
        for reg in part.data_registers() {
            if reg.name() != part::BYPASS && reg.name() != part::IDCODE && Some(reg.name()) != boundary {
                users.push(reg.name());
                sim = sim.with_register(reg.len());
            }
        }

        for instruction in part.instructions() {
            let Some(reg) = part.data_registers().get(instruction.data_register()) else {
                continue;
            };
            let register = match reg.name() {
                part::BYPASS => SimRegister::Bypass,
                part::IDCODE => SimRegister::IdCode,
                name if Some(name) == boundary => SimRegister::Boundary {
                    drive: !matches!(instruction.name(), part::SAMPLE | "SAMPLE" | "PRELOAD"),
                },
                name => match users.iter().position(|u| *u == name) {
                    Some(i) => SimRegister::User(i),
                    None => continue,
                },
            };
            sim = sim.with_instruction(instruction.code(), register);
        }
        sim
    }

    fn reset(&mut self) {
        self.selected = if self.idcode.is_some() { SimRegister::IdCode } else { SimRegister::Bypass };
        self.latched_ir = None;
    }

    fn extest(&self) -> bool {
        matches!(self.selected, SimRegister::Boundary { drive: true })
    }

    fn cell(&self, index: usize) -> bool {
        self.boundary.get(index).map(|b| *b).unwrap_or(false)
    }

    /// The level the part drives onto `pin`, if its output is enabled.
    fn driven(&self, pin: &SimPin) -> Option<bool> {
        if !self.extest() {
            return None;
        }
        let output = pin.output?;
        let enabled = match pin.control {
            Some((cell, disable)) => self.cell(cell) != disable,
            None => true,
        };
        enabled.then(|| self.cell(output))
    }

    fn level(&self, pin: &SimPin) -> bool {
        self.driven(pin).unwrap_or(true)
    }

    fn asserted(&self, memory: &SimMemory, pin: &SimPin) -> bool {
        self.level(pin) != memory.active_low
    }

    fn memory_address(&self, memory: &SimMemory) -> usize {
        let address = memory
            .address
            .iter()
            .enumerate()
            .fold(0usize, |acc, (i, pin)| acc | (usize::from(self.level(pin)) << i));
        address % memory.words.len().max(1)
    }

    /// The word the SRAM puts on the data lines, if it is being read.
    fn memory_output(&self) -> Option<u32> {
        let memory = self.memory.as_ref()?;
        let reading = self.asserted(memory, &memory.cs)
            && self.asserted(memory, &memory.oe)
            && !self.asserted(memory, &memory.we);
        if !reading {
            return None;
        }
        memory.words.get(self.memory_address(memory)).copied()
    }

    fn capture_boundary(&self) -> BitVec<u8, Lsb0> {
        let mut captured = self.boundary.clone();
        let Some(memory) = self.memory.as_ref() else {
            return captured;
        };
        let read = self.memory_output();
        let mut sample = |pin: &SimPin, level: bool| {
            if let Some(mut bit) = pin.input.and_then(|i| captured.get_mut(i)) {
                *bit = level;
            }
        };
        for pin in memory.address.iter().chain([&memory.cs, &memory.oe, &memory.we]) {
            sample(pin, self.level(pin));
        }
        for (i, pin) in memory.data.iter().enumerate() {
            let level = self
                .driven(pin)
                .or(read.map(|word| i < 32 && (word >> i) & 1 == 1))
                .unwrap_or(true);
            sample(pin, level);
        }
        captured
    }

    fn update_memory(&mut self) {
        let Some(memory) = self.memory.as_ref() else {
            return;
        };
        if !(self.asserted(memory, &memory.cs) && self.asserted(memory, &memory.we)) {
            return;
        }
        let address = self.memory_address(memory);
        let word = memory
            .data
            .iter()
            .enumerate()
            .take(32)
            .fold(0u32, |acc, (i, pin)| acc | (u32::from(self.level(pin)) << i));
        if let Some(memory) = self.memory.as_mut() {
            if let Some(slot) = memory.words.get_mut(address) {
                *slot = word;
            }
        }
    }

    fn capture_ir(&mut self) {
        self.shift = bitvec![u8, Lsb0; 0; self.ir_len];
        if self.ir_len > 0 {
            self.shift.set(0, true);
        }
    }

    fn capture_dr(&mut self) {
        self.shift = match self.selected {
            SimRegister::Bypass => bitvec![u8, Lsb0; 0],
            SimRegister::IdCode => opcode(u64::from(self.idcode.unwrap_or(0)), 32),
            SimRegister::Boundary { .. } => self.capture_boundary(),
            SimRegister::User(i) => self.registers.get(i).cloned().unwrap_or_default(),
        };
    }

    fn update_ir(&mut self) {
        let shifted = &self.shift;
        self.selected = self
            .instructions
            .iter()
            .rev()
            .find(|i| i.code == *shifted)
            .map(|i| i.register)
            .unwrap_or(SimRegister::Bypass);
        self.latched_ir = Some(self.shift.clone());
    }

    fn update_dr(&mut self) {
        match self.selected {
            SimRegister::Boundary { drive } => {
                if self.shift.len() == self.boundary.len() {
                    self.boundary = self.shift.clone();
                }
                if drive {
                    self.update_memory();
                }
            }
            SimRegister::User(i) => {
                if let Some(reg) = self.registers.get_mut(i) {
                    if reg.len() == self.shift.len() {
                        *reg = self.shift.clone();
                    }
                }
            }
            SimRegister::Bypass | SimRegister::IdCode => {}
        }
    }

    /// Move one bit through the shift register; returns the bit leaving towards TDO.
    fn shift_bit(&mut self, tdi: bool) -> bool {
        let Some(out) = self.shift.first().map(|b| *b) else {
            return tdi;
        };
        self.shift.shift_left(1);
        let last = self.shift.len() - 1;
        self.shift.set(last, tdi);
        out
    }
}

struct Inner {
    parts: Vec<SimPart>,
    state: JtagState,
    tck: bool,
    tdi: bool,
    clocks: u64,
    fail_after: Option<u64>,
    open: bool,
}

impl Inner {
    fn rising_edge(&mut self, tms: bool, tdi: bool) {
        match self.state {
            JtagState::CaptureIR => self.parts.iter_mut().for_each(SimPart::capture_ir),
            JtagState::CaptureDR => self.parts.iter_mut().for_each(SimPart::capture_dr),
            JtagState::ShiftIR | JtagState::ShiftDR => {
                let mut carry = tdi;
                for part in self.parts.iter_mut().rev() {
                    carry = part.shift_bit(carry);
                }
            }
            _ => {}
        }

        self.state = self.state.next(tms);
        self.clocks += 1;

        match self.state {
            JtagState::Reset => self.parts.iter_mut().for_each(SimPart::reset),
            JtagState::UpdateIR => self.parts.iter_mut().for_each(SimPart::update_ir),
            JtagState::UpdateDR => self.parts.iter_mut().for_each(SimPart::update_dr),
            _ => {}
        }
    }

    fn tdo(&self) -> bool {
        if !matches!(self.state, JtagState::ShiftIR | JtagState::ShiftDR) {
            return true;
        }
        self.parts
            .iter()
            .find_map(|p| p.shift.first().map(|b| *b))
            .unwrap_or(self.tdi)
    }
}

/// Handle on a simulated chain.  Clones share the same chain, so a test can keep one to look
/// inside while a cable owns another.
#[derive(Clone)]
pub struct SimTarget(Rc<RefCell<Inner>>);

impl SimTarget {
    /// The chain starts out in Test-Logic-Reset, like real parts after power-up.
    pub fn new(parts: Vec<SimPart>) -> Self {
        let mut parts = parts;
        parts.iter_mut().for_each(SimPart::reset);
        Self(Rc::new(RefCell::new(Inner {
            parts,
            state: JtagState::Reset,
            tck: false,
            tdi: true,
            clocks: 0,
            fail_after: None,
            open: false,
        })))
    }

    pub fn state(&self) -> JtagState {
        self.0.borrow().state
    }

    /// Rising TCK edges seen so far.
    pub fn clocks(&self) -> u64 {
        self.0.borrow().clocks
    }

    /// Let `edges` more clock edges through, then fail the next signal change once.
    pub fn fail_after(&self, edges: u64) {
        self.0.borrow_mut().fail_after = Some(edges);
    }

    /// The opcode `part` latched at its last Update-IR, or `None` since reset.
    pub fn latched_ir(&self, part: usize) -> Option<BitVec<u8, Lsb0>> {
        self.0.borrow().parts.get(part).and_then(|p| p.latched_ir.clone())
    }

    pub fn selected(&self, part: usize) -> Option<SimRegister> {
        self.0.borrow().parts.get(part).map(|p| p.selected)
    }

    /// The update latch of a user data register.
    pub fn register(&self, part: usize, index: usize) -> Option<BitVec<u8, Lsb0>> {
        self.0.borrow().parts.get(part).and_then(|p| p.registers.get(index).cloned())
    }

    pub fn boundary(&self, part: usize) -> Option<BitVec<u8, Lsb0>> {
        self.0.borrow().parts.get(part).map(|p| p.boundary.clone())
    }

    pub fn peek(&self, part: usize, address: usize) -> Option<u32> {
        let inner = self.0.borrow();
        inner.parts.get(part)?.memory.as_ref()?.words.get(address).copied()
    }

    pub fn poke(&self, part: usize, address: usize, word: u32) {
        let mut inner = self.0.borrow_mut();
        if let Some(slot) = inner
            .parts
            .get_mut(part)
            .and_then(|p| p.memory.as_mut())
            .and_then(|m| m.words.get_mut(address))
        {
            *slot = word;
        }
    }
}

impl Link for SimTarget {
    fn open(&mut self) -> Result<()> {
        self.0.borrow_mut().open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.0.borrow_mut().open = false;
    }

    fn is_open(&self) -> bool {
        self.0.borrow().open
    }
}

impl SignalLink for SimTarget {
    fn set_signal(&mut self, tms: bool, tck: bool, tdi: bool) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if !inner.open {
            return Err(Error::Transport("simulated link is not open".into()));
        }
        let rising = tck && !inner.tck;
        if rising {
            match inner.fail_after {
                Some(0) => {
                    inner.fail_after = None;
                    return Err(Error::Transport("simulated link failure".into()));
                }
                Some(n) => inner.fail_after = Some(n - 1),
                None => {}
            }
        }
        inner.tck = tck;
        inner.tdi = tdi;
        if rising {
            inner.rising_edge(tms, tdi);
        }
        Ok(())
    }

    fn get_signal(&mut self) -> Result<bool> {
        let inner = self.0.borrow();
        if !inner.open {
            return Err(Error::Transport("simulated link is not open".into()));
        }
        Ok(inner.tdo())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(target: &mut SimTarget, tms: bool, tdi: bool) -> bool {
        target.set_signal(tms, false, tdi).unwrap();
        let tdo = target.get_signal().unwrap();
        target.set_signal(tms, true, tdi).unwrap();
        tdo
    }

    fn walk(target: &mut SimTarget, tms: &[bool]) {
        for &t in tms {
            clock(target, t, true);
        }
    }

    /// Shift `bits`, the last one with TMS high, and return what came out.
    fn shift(target: &mut SimTarget, bits: &BitSlice<u8, Lsb0>) -> BitVec<u8, Lsb0> {
        let n = bits.len();
        bits.iter().by_vals().enumerate().map(|(i, b)| clock(target, i == n - 1, b)).collect()
    }

    fn open(parts: Vec<SimPart>) -> SimTarget {
        let mut target = SimTarget::new(parts);
        target.open().unwrap();
        target
    }

    #[test]
    fn closed_link_refuses_signals() {
        let mut target = SimTarget::new(alloc::vec![SimPart::new(4)]);
        assert!(target.set_signal(true, true, true).is_err());
    }

    #[test]
    fn ir_capture_pattern() {
        let mut target = open(alloc::vec![SimPart::new(4), SimPart::new(6)]);
        // Reset -> Idle -> SelectDR -> SelectIR -> CaptureIR -> ShiftIR
        walk(&mut target, &[false, true, true, false, false]);
        assert_eq!(target.state(), JtagState::ShiftIR);
        let out = shift(&mut target, &bitvec![u8, Lsb0; 1; 10]);
        assert_eq!(out, bits![u8, Lsb0; 1, 0, 0, 0, 1, 0, 0, 0, 0, 0]);
        walk(&mut target, &[true, false]);
        assert_eq!(target.state(), JtagState::Idle);
        assert_eq!(target.latched_ir(0), Some(bitvec![u8, Lsb0; 1; 4]));
        assert_eq!(target.selected(1), Some(SimRegister::Bypass));
    }

    #[test]
    fn idcode_selected_after_reset() {
        let mut target = open(alloc::vec![SimPart::new(4).with_idcode(0x1234_5677), SimPart::new(5)]);
        walk(&mut target, &[false, true, false, false]);
        assert_eq!(target.state(), JtagState::ShiftDR);
        let out = shift(&mut target, &bitvec![u8, Lsb0; 1; 33]);
        assert_eq!(out[..32].load_le::<u32>(), 0x1234_5677);
        assert!(!out[32]);
    }

    #[test]
    fn user_register_reads_back_last_update() {
        let part = SimPart::new(3).with_register(5).with_opcode(0b010, SimRegister::User(0));
        let mut target = open(alloc::vec![part]);
        walk(&mut target, &[false, true, true, false, false]);
        shift(&mut target, bits![u8, Lsb0; 0, 1, 0]);
        walk(&mut target, &[true, true, false, false]);
        assert_eq!(target.state(), JtagState::ShiftDR);
        let first = shift(&mut target, bits![u8, Lsb0; 1, 0, 1, 1, 0]);
        assert_eq!(first, bits![u8, Lsb0; 0; 5]);
        walk(&mut target, &[true, true, false, false]);
        let second = shift(&mut target, bits![u8, Lsb0; 0; 5]);
        assert_eq!(second, bits![u8, Lsb0; 1, 0, 1, 1, 0]);
        assert_eq!(target.register(0, 0), Some(bitvec![u8, Lsb0; 1, 0, 1, 1, 0]));
    }

    #[test]
    fn failure_is_injected_once() {
        let mut target = open(alloc::vec![SimPart::new(2)]);
        target.fail_after(1);
        clock(&mut target, true, true);
        target.set_signal(true, false, true).unwrap();
        assert!(target.set_signal(true, true, true).is_err());
        assert_eq!(target.clocks(), 1);
        clock(&mut target, true, true);
        assert_eq!(target.clocks(), 2);
    }
}
