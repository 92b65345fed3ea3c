//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine, and allows setting the state to any stable state.
//! `JtagSM` will get to that state by the shortest TMS sequence, based on the current state.
//!
//! The state is tracked optimistically: every TMS bit handed to the cable is assumed to have
//! been clocked.  If the cable reports a failure the state becomes unknown, and everything except
//! a reset is refused until the chain has been reset.
use alloc::collections::VecDeque;
use alloc::format;
use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Data,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

impl JtagState {
    pub const ALL: [JtagState; 16] = [
        JtagState::Reset,
        JtagState::Idle,
        JtagState::SelectDR,
        JtagState::CaptureDR,
        JtagState::ShiftDR,
        JtagState::Exit1DR,
        JtagState::PauseDR,
        JtagState::Exit2DR,
        JtagState::UpdateDR,
        JtagState::SelectIR,
        JtagState::CaptureIR,
        JtagState::ShiftIR,
        JtagState::Exit1IR,
        JtagState::PauseIR,
        JtagState::Exit2IR,
        JtagState::UpdateIR,
    ];

    /// The IEEE 1149.1 transition table: the state entered on the next rising TCK edge.
    pub const fn next(self, tms: bool) -> JtagState {
        use JtagState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => SelectDR,

            (SelectDR, false) => CaptureDR,
            (SelectDR, true) => SelectIR,
            (CaptureDR, false) => ShiftDR,
            (CaptureDR, true) => Exit1DR,
            (ShiftDR, false) => ShiftDR,
            (ShiftDR, true) => Exit1DR,
            (Exit1DR, false) => PauseDR,
            (Exit1DR, true) => UpdateDR,
            (PauseDR, false) => PauseDR,
            (PauseDR, true) => Exit2DR,
            (Exit2DR, false) => ShiftDR,
            (Exit2DR, true) => UpdateDR,
            (UpdateDR, false) => Idle,
            (UpdateDR, true) => SelectDR,

            (SelectIR, false) => CaptureIR,
            (SelectIR, true) => Reset,
            (CaptureIR, false) => ShiftIR,
            (CaptureIR, true) => Exit1IR,
            (ShiftIR, false) => ShiftIR,
            (ShiftIR, true) => Exit1IR,
            (Exit1IR, false) => PauseIR,
            (Exit1IR, true) => UpdateIR,
            (PauseIR, false) => PauseIR,
            (PauseIR, true) => Exit2IR,
            (Exit2IR, false) => ShiftIR,
            (Exit2IR, true) => UpdateIR,
            (UpdateIR, false) => Idle,
            (UpdateIR, true) => SelectDR,
        }
    }

    /// States the machine can be parked in; the only valid targets of [`JtagSM::change_mode`].
    pub const fn is_stable(self) -> bool {
        matches!(
            self,
            JtagState::Reset
                | JtagState::Idle
                | JtagState::ShiftDR
                | JtagState::PauseDR
                | JtagState::ShiftIR
                | JtagState::PauseIR
        )
    }

    pub const fn shift(reg: Register) -> JtagState {
        match reg {
            Register::Data => JtagState::ShiftDR,
            Register::Instruction => JtagState::ShiftIR,
        }
    }

    const fn exit1(reg: Register) -> JtagState {
        match reg {
            Register::Data => JtagState::Exit1DR,
            Register::Instruction => JtagState::Exit1IR,
        }
    }
}

/// Five TMS-high clocks reach Test-Logic-Reset from anywhere.
pub const RESET_SEQUENCE: [bool; 5] = [true; 5];

/// The shortest TMS sequence that walks from `from` to `to`.  Ties go to the path taking
/// TMS low first, so the result never changes between calls.
pub fn tms_path(from: JtagState, to: JtagState) -> BitVec<u8, Lsb0> {
    let mut via: [Option<(JtagState, bool)>; 16] = [None; 16];
    let mut seen = [false; 16];
    let mut queue = VecDeque::new();
    seen[from as usize] = true;
    queue.push_back(from);

    while let Some(state) = queue.pop_front() {
        if state == to {
            break;
        }
        for tms in [false, true] {
            let next = state.next(tms);
            if !seen[next as usize] {
                seen[next as usize] = true;
                via[next as usize] = Some((state, tms));
                queue.push_back(next);
            }
        }
    }

    let mut path = BitVec::new();
    let mut state = to;
    while let Some((prev, tms)) = via[state as usize] {
        path.push(tms);
        state = prev;
    }
    path.reverse();
    path
}

pub struct JtagSM<T> {
    pub cable: T,
    state: Option<JtagState>,
}

impl<T, U> JtagSM<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Create a JTAG state machine using an existing `Cable`.  Nothing is clocked yet, so the
    /// state is unknown until the first reset.
    pub fn new(cable: T) -> Self {
        Self {
            cable,
            state: None,
        }
    }

    /// The current TAP state, or `None` if it is unknown.
    pub fn state(&self) -> Option<JtagState> {
        self.state
    }

    fn clock_tms(&mut self, tms: &BitSlice<u8, Lsb0>, end: JtagState) -> Result<()> {
        log::trace!("TMS {tms:b} -> {end:?}");
        match self.cable.change_mode(tms, true) {
            Ok(()) => {
                self.state = Some(end);
                Ok(())
            }
            Err(e) => {
                self.state = None;
                Err(e)
            }
        }
    }

    /// Reset the scan chain by driving TMS high for 5 clocks
    pub fn mode_reset(&mut self) -> Result<()> {
        let tms: BitVec<u8, Lsb0> = RESET_SEQUENCE.iter().copied().collect();
        self.clock_tms(&tms, JtagState::Reset)
    }

    fn known_state(&self) -> Result<JtagState> {
        self.state.ok_or_else(|| {
            Error::IllegalState("TAP state is unknown after a failed transfer; reset the chain first".into())
        })
    }

    /// Walk to any state, stable or not.
    fn goto(&mut self, state: JtagState) -> Result<()> {
        let current = self.known_state()?;
        if current == state {
            return Ok(());
        }
        let path = tms_path(current, state);
        log::debug!("{current:?} -> {state:?}");
        self.clock_tms(&path, state)
    }

    /// Use TMS to get into `state` by the most efficient path.  `Reset` always clocks the full
    /// reset sequence, whatever the current state is.
    ///
    /// # Panics
    /// If `state` is not one of the stable states (Reset, Idle, ShiftDR, PauseDR, ShiftIR,
    /// PauseIR).
    pub fn change_mode(&mut self, state: JtagState) -> Result<()> {
        assert!(state.is_stable(), "{state:?} is not a state the TAP can be parked in");
        if state == JtagState::Reset {
            return self.mode_reset();
        }
        self.goto(state)
    }

    /// Spend `cycles` clocks in Run-Test/Idle.
    pub fn idle(&mut self, cycles: usize) -> Result<()> {
        self.change_mode(JtagState::Idle)?;
        if cycles > 0 {
            let tms = bitvec![u8, Lsb0; 0; cycles];
            self.clock_tms(&tms, JtagState::Idle)?;
        }
        Ok(())
    }

    /// Read `bits` from either the instruction or data register, shifting in ones.  With
    /// `exit_after` the machine ends in Exit1, otherwise it stays in the shift state.
    pub fn read_reg(&mut self, reg: Register, bits: usize, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        let ones = bitvec![u8, Lsb0; 1; bits];
        self.read_write_reg(reg, &ones, exit_after)
    }

    /// Write `data` into either the instruction or data register.
    pub fn write_reg(&mut self, reg: Register, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<()> {
        self.read_write_reg(reg, data, exit_after).map(|_| ())
    }

    /// Shift `data` into either the instruction or data register and return the bits that were
    /// shifted out while doing so.  The mode will be ShiftIR / ShiftDR afterwards if `exit_after`
    /// is false, which allows for building the register from several calls, or Exit1IR /
    /// Exit1DR if it is true.
    pub fn read_write_reg(&mut self, reg: Register, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        self.goto(JtagState::shift(reg))?;
        if data.is_empty() {
            return Ok(BitVec::new());
        }
        log::trace!("shift {reg:?} {} bits", data.len());
        let end = if exit_after { JtagState::exit1(reg) } else { JtagState::shift(reg) };
        match self.cable.read_write_data(data, exit_after) {
            Ok(out) => {
                if out.len() != data.len() {
                    self.state = None;
                    return Err(Error::Transport(format!(
                        "cable returned {} bits for a {} bit shift",
                        out.len(),
                        data.len()
                    )));
                }
                self.state = Some(end);
                Ok(out)
            }
            Err(e) => {
                self.state = None;
                Err(e)
            }
        }
    }

    /// One complete scan: Capture, Shift with the last bit leaving through Exit1, Update, and
    /// back to Run-Test/Idle.  Returns the captured bits.
    pub fn scan(&mut self, reg: Register, data: &BitSlice<u8, Lsb0>) -> Result<BitVec<u8, Lsb0>> {
        let current = self.known_state()?;
        if current != JtagState::Idle && current != JtagState::Reset {
            // Resuming from a pause would skip Capture.
            self.goto(JtagState::Idle)?;
        }
        let out = if data.is_empty() {
            self.goto(JtagState::exit1(reg))?;
            BitVec::new()
        } else {
            self.read_write_reg(reg, data, true)?
        };
        self.goto(JtagState::Idle)?;
        self.cable.flush().inspect_err(|_| self.state = None)?;
        Ok(out)
    }
}
