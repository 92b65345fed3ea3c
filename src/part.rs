//! The model of one chip on the chain: its instruction register, the instructions it knows,
//! the data registers they select, and the boundary-scan signals mapped onto its boundary
//! register.
//!
//! Bit vectors are in shift order, so index 0 is the register's LSB, the bit nearest TDO.
//! Instruction codes are written MSB first in configuration (`"0001"`), the way datasheets
//! and BSDL files print them.
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use bitvec::prelude::*;

use crate::error::{Error, Result};

pub const BYPASS: &str = "BYPASS";
pub const IDCODE: &str = "IDCODE";
pub const EXTEST: &str = "EXTEST";
pub const SAMPLE: &str = "SAMPLE/PRELOAD";
/// Default name of the boundary register.
pub const BOUNDARY: &str = "BSR";

/// The low `len` bits of `value`, LSB first.
pub fn bits_from_value(value: u64, len: usize) -> BitVec<u8, Lsb0> {
    (0..len).map(|i| i < 64 && (value >> i) & 1 == 1).collect()
}

/// Inverse of [`bits_from_value`].  Bits past 64 are ignored.
pub fn bits_to_value(bits: &BitSlice<u8, Lsb0>) -> u64 {
    bits.iter()
        .by_vals()
        .take(64)
        .enumerate()
        .fold(0, |acc, (i, b)| acc | (u64::from(b) << i))
}

/// Parse an MSB-first string of `0`/`1` into shift order.
pub fn parse_code(code: &str) -> Result<BitVec<u8, Lsb0>> {
    code.chars()
        .rev()
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            _ => Err(Error::Config(format!("bad instruction code `{code}`: only 0 and 1 allowed"))),
        })
        .collect()
}

/// Render shift-order bits as an MSB-first string.
pub fn format_code(bits: &BitSlice<u8, Lsb0>) -> String {
    bits.iter().by_vals().rev().map(|b| if b { '1' } else { '0' }).collect()
}

/// A data register.  `input` is what the next scan shifts in, `output` is what the last scan
/// captured.  Both always have the register's length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataRegister {
    name: String,
    input: BitVec<u8, Lsb0>,
    output: BitVec<u8, Lsb0>,
}

impl DataRegister {
    pub fn new(name: &str, len: usize) -> Self {
        Self {
            name: name.into(),
            input: bitvec![u8, Lsb0; 0; len],
            output: bitvec![u8, Lsb0; 0; len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn input(&self) -> &BitSlice<u8, Lsb0> {
        &self.input
    }

    /// The register keeps its length; only the contents can be changed.
    pub fn input_mut(&mut self) -> &mut BitSlice<u8, Lsb0> {
        &mut self.input
    }

    pub fn output(&self) -> &BitSlice<u8, Lsb0> {
        &self.output
    }

    pub(crate) fn set_output(&mut self, bits: &BitSlice<u8, Lsb0>) {
        debug_assert_eq!(bits.len(), self.output.len());
        self.output.copy_from_bitslice(bits);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    name: String,
    code: BitVec<u8, Lsb0>,
    data_register: usize,
}

impl Instruction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The opcode in shift order.
    pub fn code(&self) -> &BitSlice<u8, Lsb0> {
        &self.code
    }

    /// Index into [`Part::data_registers`].
    pub fn data_register(&self) -> usize {
        self.data_register
    }
}

/// The cell that enables a signal's output driver, and the cell value that turns it off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Control {
    pub cell: usize,
    pub disable: bool,
}

/// A pin of the part, as seen through its boundary register cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    pub name: String,
    pub input: Option<usize>,
    pub output: Option<usize>,
    pub control: Option<Control>,
}

#[derive(Clone, Debug)]
pub struct Part {
    name: String,
    idcode: Option<u32>,
    ir_len: usize,
    instructions: Vec<Instruction>,
    data_registers: Vec<DataRegister>,
    signals: Vec<Signal>,
    boundary: Option<usize>,

    // Latched in the instruction register; None after reset.
    instruction: Option<usize>,
    // Data register between TDI and TDO right now.
    selected: usize,
    // Instruction to load at the next instruction scan.
    pending: Option<usize>,
}

impl Part {
    /// A part with an `ir_len` bit instruction register, knowing only BYPASS.
    pub fn new(name: &str, ir_len: usize) -> Result<Self> {
        if ir_len < 2 {
            return Err(Error::Config(format!(
                "part `{name}`: instruction register must be at least 2 bits, not {ir_len}"
            )));
        }
        Ok(Self {
            name: name.into(),
            idcode: None,
            ir_len,
            instructions: alloc::vec![Instruction {
                name: BYPASS.into(),
                code: bitvec![u8, Lsb0; 1; ir_len],
                data_register: 0,
            }],
            data_registers: alloc::vec![DataRegister::new(BYPASS, 1)],
            signals: Vec::new(),
            boundary: None,
            instruction: None,
            selected: 0,
            pending: None,
        })
    }

    /// Record the part's IDCODE and add the 32 bit IDCODE register, which Test-Logic-Reset
    /// selects.
    pub fn with_idcode(mut self, idcode: u32) -> Self {
        self.idcode = Some(idcode);
        if self.data_register_index(IDCODE).is_none() {
            self.data_registers.push(DataRegister::new(IDCODE, 32));
        }
        self.reset();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idcode(&self) -> Option<u32> {
        self.idcode
    }

    pub fn instruction_length(&self) -> usize {
        self.ir_len
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn data_registers(&self) -> &[DataRegister] {
        &self.data_registers
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    fn data_register_index(&self, name: &str) -> Option<usize> {
        self.data_registers.iter().position(|r| r.name == name)
    }

    fn instruction_index(&self, name: &str) -> Option<usize> {
        self.instructions.iter().position(|i| i.name == name)
    }

    pub fn data_register(&self, name: &str) -> Option<&DataRegister> {
        self.data_registers.iter().find(|r| r.name == name)
    }

    pub fn data_register_mut(&mut self, name: &str) -> Option<&mut DataRegister> {
        self.data_registers.iter_mut().find(|r| r.name == name)
    }

    pub fn instruction(&self, name: &str) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.name == name)
    }

    /// Add a data register.  Names are unique within a part.
    pub fn add_data_register(&mut self, name: &str, len: usize) -> Result<()> {
        if self.data_register_index(name).is_some() {
            return Err(Error::Config(format!("part `{}`: data register `{name}` defined twice", self.name)));
        }
        self.data_registers.push(DataRegister::new(name, len));
        Ok(())
    }

    /// Define `name` as the MSB-first opcode `code` selecting `register`.  Redefining an
    /// instruction replaces it.
    pub fn add_instruction(&mut self, name: &str, code: &str, register: &str) -> Result<()> {
        let bits = parse_code(code)?;
        if bits.len() != self.ir_len {
            return Err(Error::Config(format!(
                "part `{}`: instruction `{name}` code `{code}` is {} bits, the instruction register is {}",
                self.name,
                bits.len(),
                self.ir_len
            )));
        }
        let data_register = self.data_register_index(register).ok_or_else(|| {
            Error::Config(format!("part `{}`: instruction `{name}` selects unknown data register `{register}`", self.name))
        })?;
        let instruction = Instruction { name: name.into(), code: bits, data_register };
        match self.instruction_index(name) {
            Some(i) => self.instructions[i] = instruction,
            None => self.instructions.push(instruction),
        }
        Ok(())
    }

    /// Use `name` as the boundary register that signals refer to.
    pub fn set_boundary_register(&mut self, name: &str) -> Result<()> {
        let index = self
            .data_register_index(name)
            .ok_or_else(|| Error::Config(format!("part `{}`: unknown boundary register `{name}`", self.name)))?;
        self.boundary = Some(index);
        Ok(())
    }

    pub fn boundary_register(&self) -> Option<&DataRegister> {
        self.boundary.and_then(|i| self.data_registers.get(i))
    }

    pub fn add_signal(&mut self, signal: Signal) -> Result<()> {
        let len = self
            .boundary_register()
            .map(DataRegister::len)
            .ok_or_else(|| Error::Config(format!("part `{}` has no boundary register for signal `{}`", self.name, signal.name)))?;
        let cells = [signal.input, signal.output, signal.control.map(|c| c.cell)];
        if let Some(cell) = cells.into_iter().flatten().find(|&c| c >= len) {
            return Err(Error::Config(format!(
                "part `{}`: signal `{}` uses cell {cell}, boundary register has {len}",
                self.name, signal.name
            )));
        }
        if self.signals.iter().any(|s| s.name == signal.name) {
            return Err(Error::Config(format!("part `{}`: signal `{}` defined twice", self.name, signal.name)));
        }
        self.signals.push(signal);
        Ok(())
    }

    pub fn signal(&self, name: &str) -> Result<&Signal> {
        self.signals
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::Config(format!("part `{}` has no signal `{name}`", self.name)))
    }

    /// Queue `name` for the next instruction scan.
    pub fn set_instruction(&mut self, name: &str) -> Result<()> {
        let index = self
            .instruction_index(name)
            .ok_or_else(|| Error::Config(format!("unknown instruction `{name}` for part `{}`", self.name)))?;
        self.pending = Some(index);
        Ok(())
    }

    /// The instruction in the instruction register, if known.
    pub fn active_instruction(&self) -> Option<&Instruction> {
        self.instruction.and_then(|i| self.instructions.get(i))
    }

    pub fn pending_instruction(&self) -> Option<&Instruction> {
        self.pending.and_then(|i| self.instructions.get(i))
    }

    /// The data register a data scan goes through.
    pub fn selected_register(&self) -> &DataRegister {
        &self.data_registers[self.selected]
    }

    pub fn selected_register_mut(&mut self) -> &mut DataRegister {
        &mut self.data_registers[self.selected]
    }

    /// The index and opcode the next instruction scan loads: the queued instruction, else the
    /// current one, else BYPASS.
    pub(crate) fn next_instruction(&self) -> (usize, &BitSlice<u8, Lsb0>) {
        let index = self.pending.or(self.instruction).unwrap_or(0);
        (index, &self.instructions[index].code)
    }

    pub(crate) fn latch(&mut self, index: usize) {
        self.instruction = Some(index);
        self.selected = self.instructions[index].data_register;
        self.pending = None;
    }

    /// Latch whatever `code` decodes to.  Opcodes the part doesn't know select BYPASS, like
    /// the standard requires.
    pub(crate) fn latch_code(&mut self, code: &BitSlice<u8, Lsb0>) {
        match self.instructions.iter().position(|i| i.code == *code) {
            Some(index) => self.latch(index),
            None => {
                self.instruction = None;
                self.selected = 0;
                self.pending = None;
            }
        }
    }

    /// Test-Logic-Reset: IDCODE if the part has one, BYPASS otherwise.
    pub(crate) fn reset(&mut self) {
        self.instruction = None;
        self.pending = None;
        self.selected = match self.idcode {
            Some(_) => self.data_register_index(IDCODE).unwrap_or(0),
            None => 0,
        };
    }

    fn boundary_mut(&mut self) -> Result<&mut DataRegister> {
        let index = self
            .boundary
            .ok_or_else(|| Error::Config(format!("part `{}` has no boundary register", self.name)))?;
        Ok(&mut self.data_registers[index])
    }

    /// Prepare the boundary register so the next data scan drives `name` to `value`, or
    /// releases it when `drive` is false.
    pub fn set_signal(&mut self, name: &str, drive: bool, value: bool) -> Result<()> {
        let signal = self.signal(name)?.clone();
        let bsr = self.boundary_mut()?;
        match (drive, signal.output, signal.control) {
            (true, Some(output), control) => {
                bsr.input_mut().set(output, value);
                if let Some(c) = control {
                    bsr.input_mut().set(c.cell, !c.disable);
                }
            }
            (true, None, _) => {
                return Err(Error::Config(format!("signal `{name}` is an input, it cannot be driven")));
            }
            (false, _, Some(c)) => bsr.input_mut().set(c.cell, c.disable),
            (false, _, None) => {
                log::debug!("signal `{name}` has no output control, left as is");
            }
        }
        Ok(())
    }

    /// The level of `name` in the last boundary capture.
    pub fn get_signal(&self, name: &str) -> Result<bool> {
        let signal = self.signal(name)?;
        let cell = signal
            .input
            .ok_or_else(|| Error::Config(format!("signal `{name}` is an output, it cannot be sampled")))?;
        let bsr = self
            .boundary_register()
            .ok_or_else(|| Error::Config(format!("part `{}` has no boundary register", self.name)))?;
        Ok(bsr.output()[cell])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part() -> Part {
        let mut part = Part::new("cpu", 4).unwrap().with_idcode(0x0ba0_0477);
        part.add_data_register(BOUNDARY, 6).unwrap();
        part.set_boundary_register(BOUNDARY).unwrap();
        part.add_instruction(EXTEST, "0000", BOUNDARY).unwrap();
        part.add_instruction(IDCODE, "0001", IDCODE).unwrap();
        part.add_signal(Signal {
            name: "D0".into(),
            input: Some(0),
            output: Some(1),
            control: Some(Control { cell: 2, disable: true }),
        })
        .unwrap();
        part
    }

    #[test]
    fn codes_are_msb_first() {
        let bits = parse_code("0001").unwrap();
        assert_eq!(bits, bits![u8, Lsb0; 1, 0, 0, 0]);
        assert_eq!(format_code(&bits), "0001");
        assert!(parse_code("01x1").is_err());
        assert_eq!(bits_to_value(&bits_from_value(0xab, 8)), 0xab);
    }

    #[test]
    fn bypass_is_built_in() {
        let part = Part::new("fpga", 6).unwrap();
        let bypass = part.instruction(BYPASS).unwrap();
        assert_eq!(bypass.code(), bits![u8, Lsb0; 1; 6]);
        assert_eq!(part.selected_register().len(), 1);
        assert!(Part::new("tiny", 1).is_err());
    }

    #[test]
    fn reset_selects_idcode() {
        let mut part = part();
        assert_eq!(part.selected_register().name(), IDCODE);
        part.set_instruction(EXTEST).unwrap();
        let (index, _) = part.next_instruction();
        part.latch(index);
        assert_eq!(part.selected_register().name(), BOUNDARY);
        part.reset();
        assert_eq!(part.selected_register().name(), IDCODE);
        assert!(part.active_instruction().is_none());
    }

    #[test]
    fn bad_definitions() {
        let mut part = part();
        assert_eq!(part.add_instruction("X", "000", BOUNDARY).unwrap_err().kind(), crate::error::ErrorKind::Config);
        assert!(part.add_instruction("X", "0101", "NOPE").is_err());
        assert!(part.set_instruction("NOPE").is_err());
        let far = Signal { name: "A9".into(), input: Some(6), output: None, control: None };
        assert!(part.add_signal(far).is_err());
    }

    #[test]
    fn unknown_opcode_selects_bypass() {
        let mut part = part();
        part.latch_code(bits![u8, Lsb0; 0, 1, 0, 1]);
        assert_eq!(part.selected_register().name(), BYPASS);
        part.latch_code(bits![u8, Lsb0; 1, 0, 0, 0]);
        assert_eq!(part.active_instruction().map(Instruction::name), Some(IDCODE));
    }

    #[test]
    fn signals_use_cells() {
        let mut part = part();
        part.set_signal("D0", true, true).unwrap();
        assert_eq!(part.boundary_register().unwrap().input(), bits![u8, Lsb0; 0, 1, 0, 0, 0, 0]);
        part.set_signal("D0", false, false).unwrap();
        assert_eq!(part.boundary_register().unwrap().input(), bits![u8, Lsb0; 0, 1, 1, 0, 0, 0]);
        assert!(!part.get_signal("D0").unwrap());
        assert!(part.get_signal("D9").is_err());
    }
}
