//! Implement the `Cable` trait for "jtagkey" compatible hardware adapters like the Bus Blaster,
//! through the MPSSE engine of FTDI's D2XX driver.
use std::fmt::Debug;
use std::time::Duration;
use std::vec::Vec;
use std::{format, vec};

use bitvec::prelude::*;
use ftdi_mpsse::{ClockTMS, ClockTMSOut};
use libftd2xx::{ClockBits, ClockData};
use libftd2xx::{Ft2232h, Ftdi, FtdiCommon, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};

use crate::cable::Cable;
use crate::error::{Error, Result};

/// Commands are sent once this many bytes are queued.
const MAX_BUFFER: usize = 4096;

fn ft_error<E: Debug>(what: &str, e: E) -> Error {
    Error::Transport(format!("{what}: {e:?}"))
}

fn pack(bits: &BitSlice<u8, Lsb0>) -> Vec<u8> {
    let mut bv: BitVec<u8, Lsb0> = bits.iter().by_vals().collect();
    bv.set_uninitialized(false);
    bv.into_vec()
}

pub struct Mpsse<T> {
    ft: T,
    // Commands not yet sent to the adapter
    buffer: Vec<u8>,
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Mpsse<T>
    where <T as MpsseCmdExecutor>::Error: Debug
{
    pub fn new(mut ft: T, clock: u32) -> Result<Self>
    {
        ft.initialize_mpsse_default().map_err(|e| ft_error("MPSSE init", e))?;
        ft.set_clock(clock).map_err(|e| ft_error("MPSSE clock", e))?;

        let builder = MpsseCmdBuilder::new()
            .disable_3phase_data_clocking()
            .disable_adaptive_data_clocking();
        ft.send(builder.as_slice()).map_err(|e| ft_error("MPSSE send", e))?;

        Ok(Self {
            ft,
            buffer: vec![],
        })
    }

    fn queue(&mut self, builder: MpsseCmdBuilder) -> Result<()> {
        if builder.as_slice().len() + self.buffer.len() > MAX_BUFFER {
            self.flush()?;
        }
        self.buffer.extend_from_slice(builder.as_slice());
        Ok(())
    }
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Cable for Mpsse<T>
    where <T as MpsseCmdExecutor>::Error: Debug
{
    fn change_mode(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: bool) -> Result<()> {
        let mut builder = MpsseCmdBuilder::new();

        // clock_tms_out takes at most 7 bits at a time
        for chunk in tms.chunks(7) {
            let buf = chunk.iter().by_vals().enumerate().fold(0u8, |acc, (i, x)| acc | (u8::from(x) << i));
            builder = builder.clock_tms_out(ClockTMSOut::NegEdge, buf, tdi, chunk.len() as u8);
        }
        self.queue(builder)
    }

    fn read_write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        if data.is_empty() {
            return Ok(BitVec::new());
        }

        // With `exit_after` the last bit goes out with clock_tms
        let body = if exit_after { &data[..data.len() - 1] } else { data };
        let whole = body.len() / 8;
        let rest = body.len() % 8;

        let mut builder = MpsseCmdBuilder::new();
        let packed = pack(body);
        if whole > 0 {
            builder = builder.clock_data(ClockData::LsbPosIn, &packed[..whole]);
        }
        if rest > 0 {
            builder = builder.clock_bits(ClockBits::LsbPosIn, packed[whole], rest as u8);
        }
        if exit_after {
            let last_bit = data[data.len() - 1];
            builder = builder.clock_tms(ClockTMS::NegTMSPosTDO, 1, last_bit, 1);
        }

        let read_bytes = whole + usize::from(rest > 0) + usize::from(exit_after);
        self.buffer.extend_from_slice(builder.as_slice());
        let mut recv = vec![0; read_bytes];
        self.ft.xfer(&self.buffer, &mut recv).map_err(|e| ft_error("MPSSE transfer", e))?;
        self.buffer.clear();

        let mut out = BitVec::<u8, Lsb0>::from_slice(&recv[..whole]);
        if rest > 0 {
            // Partial bytes come back in the top bits
            let byte = recv[whole] >> (8 - rest);
            out.extend((0..rest).map(|i| (byte >> i) & 1 != 0));
        }
        if exit_after {
            out.push(recv[read_bytes - 1] & 0x80 != 0);
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.ft.send(&self.buffer).map_err(|e| ft_error("MPSSE send", e))?;
            self.buffer.clear();
        }
        Ok(())
    }
}

// Lower pins
const PIN_TCK: u8 = 1;
const PIN_TDI: u8 = 1 << 1;
//const PIN_TDO: u8 = 1 << 2;
const PIN_TMS: u8 = 1 << 3;
const PIN_N_OE: u8 = 1 << 4;
const LOWER_OUTPUT_PINS: u8 = PIN_TCK | PIN_TDI | PIN_TMS | PIN_N_OE;

// Upper pins
const PIN_N_TRST: u8 = 1;
const PIN_N_SRST: u8 = 1 << 1;
const PIN_N_TRST_OE: u8 = 1 << 2;
const PIN_N_SRST_OE: u8 = 1 << 3;
const UPPER_OUTPUT_PINS: u8 = PIN_N_TRST | PIN_N_SRST | PIN_N_TRST_OE | PIN_N_SRST_OE;

pub struct JtagKey {
    ft: Mpsse<Ft2232h>,
}

impl JtagKey {
    /// Open a JtagKey.  FT2232-based adapters like JtagKey have both an "A" interface and a
    /// "B" interface.  `primary` controls which to use. `clock` controls the speed of TCLK in hertz.
    pub fn new(clock: u32, primary: bool) -> Result<Self> {
        let description = if primary {
            "Dual RS232-HS A"
        } else {
            "Dual RS232-HS B"
        };
        let ft = Ftdi::with_description(description)
            .map_err(|e| Error::NotFound(format!("no FTDI device `{description}`: {e:?}")))?;
        let ft = Ft2232h::try_from(ft).map_err(|e| ft_error("FT2232H", e))?;
        let mut ft = Mpsse::new(ft, clock)?;
        ft.ft.set_latency_timer(Duration::from_millis(1)).map_err(|e| ft_error("latency", e))?;
        ft.ft.set_gpio_upper(PIN_N_TRST | PIN_N_SRST, UPPER_OUTPUT_PINS).map_err(|e| ft_error("pins", e))?;

        let builder = MpsseCmdBuilder::new()
            .set_gpio_lower(PIN_TMS, LOWER_OUTPUT_PINS);
        ft.ft.send(builder.as_slice()).map_err(|e| ft_error("pins", e))?;
        log::info!("JtagKey on `{description}` at {clock} Hz");

        Ok(JtagKey {
            ft,
        })
    }

    /// JtagKey adapters implement the optional SRST signal.  This function puts the system in reset.
    pub fn assert_srst(&mut self) -> Result<()> {
        self.ft.ft.set_gpio_upper(PIN_N_TRST, UPPER_OUTPUT_PINS).map_err(|e| ft_error("pins", e))
    }

    /// JtagKey adapters implement the optional SRST signal.  This function takes the system out of
    /// reset.
    pub fn deassert_srst(&mut self) -> Result<()> {
        self.ft.ft.set_gpio_upper(PIN_N_TRST | PIN_N_SRST, UPPER_OUTPUT_PINS).map_err(|e| ft_error("pins", e))
    }
}

impl Cable for JtagKey {
    fn change_mode(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: bool) -> Result<()> {
        self.ft.change_mode(tms, tdi)
    }

    fn read_write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        self.ft.read_write_data(data, exit_after)
    }

    fn flush(&mut self) -> Result<()> {
        self.ft.flush()
    }
}
