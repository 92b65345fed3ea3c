//! The chain of parts behind one cable.  This is the layer most users want: it knows which
//! part sits where, builds chain-wide shift vectors out of each part's registers, and hands
//! the captured bits back to the parts.
//!
//! Parts are numbered in chain order.  Part 0 is the last part before the adapter's TDO input,
//! so its register bits are the first ones clocked, LSB first; then part 1, and so on.
use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::part::{Part, BYPASS};
use crate::statemachine::{JtagSM, JtagState, Register};

/// Longest chain-wide instruction or data register `detect` is prepared to find.
pub const MAX_CHAIN_BITS: usize = 1024;

pub struct Chain {
    pub sm: JtagSM<Box<dyn Cable>>,
    parts: Vec<Part>,
}

/// Whether `idcode` could come from a real part.  The manufacturer identity `0x7f` is
/// reserved, and `0` is not assigned; the LSB of an IDCODE is always set.
pub fn valid_idcode(idcode: u32) -> bool {
    let manufacturer = (idcode >> 1) & 0x7f;
    idcode & 1 == 1 && manufacturer != 0 && manufacturer != 0x7f
}

/// Split a Test-Logic-Reset data capture into parts: `Some(idcode)` for a part that put its
/// 32 bit IDCODE on the chain, `None` for a part in BYPASS.  Stops at the first all-ones word,
/// which is the fill shifted in behind the chain, or at a shorter tail of ones when the chain
/// took up nearly the whole capture.
pub fn extract_idcodes(mut dr: &BitSlice<u8, Lsb0>) -> Result<Vec<Option<u32>>> {
    let mut idcodes = Vec::new();

    while !dr.is_empty() {
        if dr[0] {
            if dr.len() < 32 {
                if dr.all() {
                    break;
                }
                return Err(Error::NotFound(format!("truncated IDCODE after {} parts", idcodes.len())));
            }
            let idcode = dr[..32].load_le::<u32>();
            if idcode == u32::MAX {
                break;
            }
            if !valid_idcode(idcode) {
                return Err(Error::NotFound(format!("invalid IDCODE 0x{idcode:08x} at part {}", idcodes.len())));
            }
            log::info!("found IDCODE 0x{idcode:08x}");
            idcodes.push(Some(idcode));
            dr = &dr[32..];
        } else {
            log::info!("found part in BYPASS");
            idcodes.push(None);
            dr = &dr[1..];
        }
    }
    Ok(idcodes)
}

/// Convert a list of start positions to a list of lengths.
fn starts_to_lengths(starts: &[usize], total: usize) -> Vec<usize> {
    let mut lens: Vec<usize> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    lens.push(total - starts.last().copied().unwrap_or(0));
    lens
}

/// Work out the instruction register lengths from an instruction capture of the whole chain.
///
/// Every capture starts with `1, 0`, but the remaining bits are the part's business and may
/// contain `1, 0` as well, so the candidate starts are only a superset.  If there are exactly
/// as many candidates as parts, or just one part, the lengths are unambiguous.  Otherwise they
/// have to be supplied in `expected`, and are checked against the capture.
pub fn extract_ir_lengths(ir: &BitSlice<u8, Lsb0>, n_parts: usize, expected: Option<&[usize]>) -> Result<Vec<usize>> {
    let starts: Vec<usize> = ir
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] && !w[1])
        .map(|(i, _)| i)
        .collect();
    log::trace!("possible IR starts: {starts:?}");

    let invalid = |msg: &str| Err(Error::NotFound(format!("invalid instruction register scan: {msg}")));

    if n_parts == 0 {
        return invalid("no parts");
    }
    if n_parts > starts.len() {
        return invalid("fewer instruction registers than parts");
    }
    if starts[0] != 0 {
        return invalid("capture does not start with 1, 0");
    }

    if let Some(expected) = expected {
        if expected.len() != n_parts {
            return invalid(&format!("{} lengths given for {n_parts} parts", expected.len()));
        }
        if expected.iter().sum::<usize>() != ir.len() {
            return invalid(&format!(
                "lengths add up to {} bits, the chain has {}",
                expected.iter().sum::<usize>(),
                ir.len()
            ));
        }
        let mut at = 0;
        for (i, len) in expected.iter().enumerate() {
            if !starts.contains(&at) {
                return invalid(&format!("part {i} capture at bit {at} does not start with 1, 0"));
            }
            at += len;
        }
        return Ok(expected.to_vec());
    }

    if n_parts == 1 {
        Ok(alloc::vec![ir.len()])
    } else if n_parts == starts.len() {
        Ok(starts_to_lengths(&starts, ir.len()))
    } else {
        invalid("ambiguous, instruction lengths must be given")
    }
}

/// Count how many bits a register of unknown length delays the fill: shift `ones, zeros,
/// ones` of `MAX_CHAIN_BITS` each and find where the zeros come out.  The register ends up
/// loaded with ones.
fn measure(sm: &mut JtagSM<Box<dyn Cable>>, reg: Register) -> Result<(usize, BitVec<u8, Lsb0>)> {
    let m = MAX_CHAIN_BITS;
    let mut fill = bitvec![u8, Lsb0; 1; 3 * m];
    fill[m..2 * m].fill(false);
    let out = sm.scan(reg, &fill)?;
    let len = out[m..]
        .first_zero()
        .ok_or_else(|| Error::NotFound("TDO stuck at 1, no parts found".into()))?;
    if len > m {
        return Err(Error::NotFound(format!("{reg:?} register chain longer than {m} bits")));
    }
    Ok((len, out[..len].to_bitvec()))
}

impl Chain {
    pub fn new(sm: JtagSM<Box<dyn Cable>>) -> Self {
        Self { sm, parts: Vec::new() }
    }

    pub fn from_cable(cable: Box<dyn Cable>) -> Self {
        Self::new(JtagSM::new(cable))
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn part(&self, index: usize) -> Result<&Part> {
        let n = self.parts.len();
        self.parts
            .get(index)
            .ok_or_else(|| Error::Config(format!("no part {index}, the chain has {n}")))
    }

    pub fn part_mut(&mut self, index: usize) -> Result<&mut Part> {
        let n = self.parts.len();
        self.parts
            .get_mut(index)
            .ok_or_else(|| Error::Config(format!("no part {index}, the chain has {n}")))
    }

    /// Append a part at the TDI end of the chain.
    pub fn add_part(&mut self, part: Part) {
        log::debug!("part {}: {}", self.parts.len(), part.name());
        self.parts.push(part);
    }

    pub fn state(&self) -> Option<JtagState> {
        self.sm.state()
    }

    /// Test-Logic-Reset, then Run-Test/Idle.  Every part falls back to IDCODE or BYPASS.
    pub fn reset(&mut self) -> Result<()> {
        self.sm.change_mode(JtagState::Reset)?;
        self.parts.iter_mut().for_each(Part::reset);
        self.sm.change_mode(JtagState::Idle)
    }

    /// Reset and load BYPASS into every part.
    pub fn reset_bypass(&mut self) -> Result<()> {
        self.reset()?;
        for part in self.parts.iter_mut() {
            part.set_instruction(BYPASS)?;
        }
        self.shift_instructions().map(|_| ())
    }

    /// Spend `cycles` clocks in Run-Test/Idle.
    pub fn idle(&mut self, cycles: usize) -> Result<()> {
        self.sm.idle(cycles)
    }

    /// Total length of the chain-wide register: every part's instruction register, or every
    /// part's selected data register.
    pub fn length(&self, reg: Register) -> usize {
        match reg {
            Register::Instruction => self.parts.iter().map(Part::instruction_length).sum(),
            Register::Data => self.parts.iter().map(|p| p.selected_register().len()).sum(),
        }
    }

    /// Queue `instruction` on part `part` and load the instruction registers of the whole
    /// chain.  The other parts keep their instruction.
    pub fn select_instruction(&mut self, part: usize, instruction: &str) -> Result<()> {
        self.part_mut(part)?.set_instruction(instruction)?;
        self.shift_instructions().map(|_| ())
    }

    /// Load every part's queued instruction, falling back to its current one, or BYPASS when
    /// that is unknown.  Returns the instruction capture.
    pub fn shift_instructions(&mut self) -> Result<BitVec<u8, Lsb0>> {
        let mut bits = BitVec::with_capacity(self.length(Register::Instruction));
        let mut latch = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let (index, code) = part.next_instruction();
            bits.extend_from_bitslice(code);
            latch.push(index);
        }
        log::debug!("shift IR {} bits", bits.len());
        let captured = self.sm.scan(Register::Instruction, &bits)?;
        for (part, index) in self.parts.iter_mut().zip(latch) {
            part.latch(index);
        }
        Ok(captured)
    }

    /// Scan every part's selected data register: shift in its `input`, and store what was
    /// captured in its `output`.  Returns the chain-wide capture.
    pub fn shift_data_registers(&mut self) -> Result<BitVec<u8, Lsb0>> {
        let mut bits = BitVec::with_capacity(self.length(Register::Data));
        for part in &self.parts {
            bits.extend_from_bitslice(part.selected_register().input());
        }
        log::debug!("shift DR {} bits", bits.len());
        let captured = self.sm.scan(Register::Data, &bits)?;
        let mut rest = &captured[..];
        for part in self.parts.iter_mut() {
            let reg = part.selected_register_mut();
            let (mine, tail) = rest.split_at(reg.len());
            reg.set_output(mine);
            rest = tail;
        }
        Ok(captured)
    }

    /// Shift a raw chain-wide vector.  `bits_in` must be exactly as long as the chain register.
    /// Instruction scans update each part's view of its instruction; data scans update the
    /// selected registers as `shift_data_registers` does.
    pub fn shift(&mut self, reg: Register, bits_in: &BitSlice<u8, Lsb0>) -> Result<BitVec<u8, Lsb0>> {
        let expected = self.length(reg);
        if bits_in.len() != expected {
            return Err(Error::IllegalState(format!(
                "{reg:?} shift of {} bits, the chain register is {expected} bits",
                bits_in.len()
            )));
        }
        let captured = self.sm.scan(reg, bits_in)?;

        let mut at = 0;
        for part in self.parts.iter_mut() {
            match reg {
                Register::Instruction => {
                    let len = part.instruction_length();
                    part.latch_code(&bits_in[at..at + len]);
                    at += len;
                }
                Register::Data => {
                    let reg = part.selected_register_mut();
                    let len = reg.len();
                    reg.input_mut().copy_from_bitslice(&bits_in[at..at + len]);
                    reg.set_output(&captured[at..at + len]);
                    at += len;
                }
            }
        }
        Ok(captured)
    }

    /// Discover the chain: read the IDCODEs Test-Logic-Reset put on it, measure the
    /// instruction registers, and replace the part list with generic parts that only know
    /// BYPASS (plus their IDCODE register).  All parts end up in BYPASS.
    pub fn detect(&mut self) -> Result<()> {
        self.detect_inner(None)
    }

    /// Like [`detect`](Self::detect), but with known instruction register lengths, which are
    /// checked against the chain instead of guessed.
    pub fn detect_with_lengths(&mut self, ir_lengths: &[usize]) -> Result<()> {
        self.detect_inner(Some(ir_lengths))
    }

    fn detect_inner(&mut self, expected: Option<&[usize]>) -> Result<()> {
        self.sm.change_mode(JtagState::Reset)?;
        self.sm.change_mode(JtagState::Idle)?;

        let ones = bitvec![u8, Lsb0; 1; MAX_CHAIN_BITS];
        let dr = self.sm.scan(Register::Data, &ones)?;
        let idcodes = extract_idcodes(&dr)?;
        if idcodes.is_empty() {
            return Err(Error::NotFound("no parts found on the chain".into()));
        }

        let (ir_len, ir) = measure(&mut self.sm, Register::Instruction)?;
        log::debug!("instruction chain is {ir_len} bits");
        let lengths = extract_ir_lengths(&ir, idcodes.len(), expected)?;

        // Every part is in BYPASS now, so the data chain is one bit per part
        let (bypass, _) = measure(&mut self.sm, Register::Data)?;
        if bypass != idcodes.len() {
            return Err(Error::NotFound(format!(
                "{} parts found by IDCODE, but {bypass} BYPASS bits",
                idcodes.len()
            )));
        }

        let mut parts = Vec::with_capacity(idcodes.len());
        for (i, (idcode, len)) in idcodes.into_iter().zip(lengths).enumerate() {
            let mut part = Part::new(&format!("part{i}"), len)?;
            if let Some(idcode) = idcode {
                part = part.with_idcode(idcode);
            }
            part.latch(0);
            log::info!("part {i}: IR {len} bits, IDCODE {}", idcode.map_or("none".into(), |c| format!("0x{c:08x}")));
            parts.push(part);
        }
        self.parts = parts;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::bitbang::BitBang;
    use crate::error::ErrorKind;
    use crate::link::sim::{SimPart, SimRegister, SimTarget};
    use crate::part::{bits_from_value, IDCODE};

    fn chain(sim: Vec<SimPart>) -> (SimTarget, Chain) {
        let target = SimTarget::new(sim);
        let cable = BitBang::new(target.clone()).unwrap();
        (target, Chain::from_cable(Box::new(cable)))
    }

    /// Two parts with IR lengths 4 and 8, each with a 16 bit user register.
    fn two_parts() -> (SimTarget, Chain) {
        let (target, mut chain) = chain(alloc::vec![
            SimPart::new(4).with_idcode(0x4ba0_0477).with_register(16).with_opcode(0x1, SimRegister::User(0)),
            SimPart::new(8).with_register(16).with_opcode(0xab, SimRegister::User(0)),
        ]);
        let mut p0 = Part::new("cpu", 4).unwrap().with_idcode(0x4ba0_0477);
        p0.add_data_register("USER", 16).unwrap();
        p0.add_instruction("USER", "0001", "USER").unwrap();
        let mut p1 = Part::new("fpga", 8).unwrap();
        p1.add_data_register("USER", 16).unwrap();
        p1.add_instruction("USER", "10101011", "USER").unwrap();
        chain.add_part(p0);
        chain.add_part(p1);
        (target, chain)
    }

    #[test]
    fn idcode_extraction() {
        let mut dr = bits_from_value(0x4ba0_0477, 32);
        dr.push(false);
        dr.extend(bitvec![u8, Lsb0; 1; 40]);
        assert_eq!(extract_idcodes(&dr).unwrap(), [Some(0x4ba0_0477), None]);

        let bad = bits_from_value(0x0000_00ff, 32);
        assert_eq!(extract_idcodes(&bad).unwrap_err().kind(), ErrorKind::NotFound);

        // Fewer than 32 fill bits left behind the last part
        let mut dr = bits_from_value(0x4ba0_0477, 32);
        dr.extend(bitvec![u8, Lsb0; 1; 7]);
        assert_eq!(extract_idcodes(&dr).unwrap(), [Some(0x4ba0_0477)]);

        let mut truncated = bits_from_value(0x4ba0_0477, 32);
        truncated.extend_from_bitslice(bits![u8, Lsb0; 1, 1, 0, 1]);
        assert_eq!(extract_idcodes(&truncated).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn ir_lengths() {
        let ir = bits![u8, Lsb0; 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(extract_ir_lengths(ir, 2, None).unwrap(), [4, 8]);
        assert_eq!(extract_ir_lengths(ir, 1, None).unwrap(), [12]);
        assert!(extract_ir_lengths(ir, 3, None).is_err());

        let ambiguous = bits![u8, Lsb0; 1, 0, 1, 0, 1, 0, 0, 0];
        assert!(extract_ir_lengths(ambiguous, 2, None).is_err());
        assert_eq!(extract_ir_lengths(ambiguous, 2, Some(&[4, 4])).unwrap(), [4, 4]);
        assert!(extract_ir_lengths(ambiguous, 2, Some(&[3, 5])).is_err());
    }

    #[test]
    fn instruction_scan_in_chain_order() {
        let (target, mut chain) = two_parts();
        chain.reset().unwrap();
        chain.part_mut(0).unwrap().set_instruction("USER").unwrap();
        chain.part_mut(1).unwrap().set_instruction("USER").unwrap();
        assert_eq!(chain.length(Register::Instruction), 12);

        let captured = chain.shift_instructions().unwrap();
        assert_eq!(captured, bits![u8, Lsb0; 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(chain.state(), Some(JtagState::Idle));
        assert_eq!(target.state(), JtagState::Idle);
        assert_eq!(target.latched_ir(0), Some(bits_from_value(0x1, 4)));
        assert_eq!(target.latched_ir(1), Some(bits_from_value(0xab, 8)));
        assert_eq!(chain.length(Register::Data), 32);
    }

    #[test]
    fn data_scan_captures_before_update() {
        let (target, mut chain) = two_parts();
        chain.reset().unwrap();
        chain.select_instruction(0, "USER").unwrap();
        assert_eq!(target.selected(0), Some(SimRegister::User(0)));
        assert_eq!(chain.length(Register::Data), 17);

        let v = bits_from_value(0xbeef, 16);
        chain.part_mut(0).unwrap().selected_register_mut().input_mut().copy_from_bitslice(&v);
        chain.shift_data_registers().unwrap();
        assert_eq!(chain.part(0).unwrap().selected_register().output(), bits![u8, Lsb0; 0; 16]);

        chain.part_mut(0).unwrap().selected_register_mut().input_mut().fill(false);
        chain.shift_data_registers().unwrap();
        assert_eq!(chain.part(0).unwrap().selected_register().output(), &v[..]);
        assert_eq!(target.register(0, 0), Some(bitvec![u8, Lsb0; 0; 16]));
    }

    #[test]
    fn changing_one_instruction_changes_one_contribution() {
        let (_target, mut chain) = two_parts();
        chain.reset().unwrap();
        // IDCODE on part 0, BYPASS on part 1
        assert_eq!(chain.length(Register::Data), 33);
        chain.select_instruction(1, "USER").unwrap();
        // part 0 was refilled with BYPASS since its instruction was unknown after reset
        assert_eq!(chain.length(Register::Data), 1 + 16);
        // The register exists, but no instruction selects it
        assert_eq!(chain.select_instruction(0, IDCODE).unwrap_err().kind(), ErrorKind::Config);
        chain.select_instruction(0, "USER").unwrap();
        assert_eq!(chain.length(Register::Data), 16 + 16);
    }

    #[test]
    fn raw_shift_checks_length() {
        let (_target, mut chain) = two_parts();
        chain.reset().unwrap();
        let err = chain.shift(Register::Instruction, &bitvec![u8, Lsb0; 1; 11]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        let mut ir = bits_from_value(0x1, 4);
        ir.extend_from_bitslice(&bits_from_value(0xff, 8));
        chain.shift(Register::Instruction, &ir).unwrap();
        assert_eq!(chain.part(0).unwrap().active_instruction().map(|i| i.name()), Some("USER"));
        assert_eq!(chain.part(1).unwrap().active_instruction().map(|i| i.name()), Some(BYPASS));
    }

    #[test]
    fn reset_is_idempotent() {
        let (target, mut chain) = two_parts();
        chain.reset().unwrap();
        let clocks = target.clocks();
        chain.reset().unwrap();
        assert_eq!(target.clocks(), 2 * clocks);
        assert_eq!(chain.state(), Some(JtagState::Idle));
        assert_eq!(target.state(), JtagState::Idle);
        assert_eq!(chain.part(0).unwrap().selected_register().name(), IDCODE);
    }

    #[test]
    fn reset_bypass_loads_ones() {
        let (target, mut chain) = two_parts();
        chain.reset_bypass().unwrap();
        assert_eq!(target.latched_ir(0), Some(bitvec![u8, Lsb0; 1; 4]));
        assert_eq!(target.latched_ir(1), Some(bitvec![u8, Lsb0; 1; 8]));
        assert_eq!(chain.length(Register::Data), 2);
    }

    #[test]
    fn detect_finds_parts() {
        let (target, mut chain) = chain(alloc::vec![
            SimPart::new(4).with_idcode(0x4ba0_0477),
            SimPart::new(6),
            SimPart::new(10).with_idcode(0x0362_d093),
        ]);
        chain.detect().unwrap();
        let parts = chain.parts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].idcode(), Some(0x4ba0_0477));
        assert_eq!(parts[1].idcode(), None);
        assert_eq!(parts[2].idcode(), Some(0x0362_d093));
        let lengths: Vec<_> = parts.iter().map(Part::instruction_length).collect();
        assert_eq!(lengths, [4, 6, 10]);
        assert_eq!(target.selected(2), Some(SimRegister::Bypass));
        assert_eq!(chain.length(Register::Data), 3);
        assert_eq!(chain.state(), Some(JtagState::Idle));
    }

    #[test]
    fn detect_long_chain() {
        // 31 * 32 + 1 = 993 data bits, leaving only 31 bits of fill in the capture
        let mut sim: Vec<SimPart> = (0..31u32).map(|i| SimPart::new(2).with_idcode(0x4ba0_0477 + (i << 12))).collect();
        sim.push(SimPart::new(2));
        let (_target, mut chain) = chain(sim);
        chain.detect().unwrap();

        let parts = chain.parts();
        assert_eq!(parts.len(), 32);
        assert_eq!(parts[30].idcode(), Some(0x4ba0_0477 + (30 << 12)));
        assert_eq!(parts[31].idcode(), None);
        assert!(parts.iter().all(|p| p.instruction_length() == 2));
        assert_eq!(chain.length(Register::Data), 32);
    }

    #[test]
    fn empty_register_is_transparent() {
        let (target, mut chain) = chain(alloc::vec![
            SimPart::new(4).with_register(0).with_opcode(0x2, SimRegister::User(0)),
            SimPart::new(8).with_register(8).with_opcode(0xab, SimRegister::User(0)),
        ]);
        let mut p0 = Part::new("cpld", 4).unwrap();
        p0.add_data_register("EMPTY", 0).unwrap();
        p0.add_instruction("EMPTY", "0010", "EMPTY").unwrap();
        let mut p1 = Part::new("fpga", 8).unwrap();
        p1.add_data_register("USER", 8).unwrap();
        p1.add_instruction("USER", "10101011", "USER").unwrap();
        chain.add_part(p0);
        chain.add_part(p1);

        chain.reset().unwrap();
        chain.part_mut(0).unwrap().set_instruction("EMPTY").unwrap();
        chain.part_mut(1).unwrap().set_instruction("USER").unwrap();
        chain.shift_instructions().unwrap();
        assert_eq!(target.selected(0), Some(SimRegister::User(0)));
        assert_eq!(chain.length(Register::Data), 8);

        let v = bits_from_value(0xa5, 8);
        chain.part_mut(1).unwrap().selected_register_mut().input_mut().copy_from_bitslice(&v);
        let captured = chain.shift_data_registers().unwrap();
        assert_eq!(captured.len(), 8);
        chain.shift_data_registers().unwrap();
        assert!(chain.part(0).unwrap().selected_register().output().is_empty());
        assert_eq!(chain.part(1).unwrap().selected_register().output(), &v[..]);
        assert_eq!(target.register(1, 0), Some(v));
    }

    #[test]
    fn detect_with_wrong_lengths() {
        let (_target, mut chain) = chain(alloc::vec![SimPart::new(4), SimPart::new(5)]);
        assert!(chain.detect_with_lengths(&[5, 4]).is_err());
        chain.detect_with_lengths(&[4, 5]).unwrap();
        assert_eq!(chain.parts()[1].instruction_length(), 5);
    }

    #[test]
    fn failed_shift_needs_reset() {
        let (target, mut chain) = two_parts();
        chain.reset().unwrap();
        target.fail_after(2);
        assert_eq!(chain.shift_instructions().unwrap_err().kind(), ErrorKind::Transport);
        let err = chain.shift_data_registers().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        chain.reset().unwrap();
        chain.shift_data_registers().unwrap();
    }
}
