//! Implement the `Cable` trait for Altera USB Blaster and clones
//!
//! The Blaster is an FT245 behind a CPLD.  Every byte written in bit-bang mode sets the JTAG
//! pins; with `READ` set the CPLD also sends back one byte holding TDO in bit 0.  Each IN packet
//! from the FT245 starts with two modem status bytes that have to be dropped.
use std::format;
use std::vec::Vec;

use bitvec::prelude::*;

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::link::usbconn::{UsbConn, UsbMatch};
use crate::link::Link;

const VID: u16 = 0x09fb;
const PID: u16 = 0x6001;

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;
const PACKET: usize = 64;
const STATUS_BYTES: usize = 2;

const PIN_TCK: u8 = 1;
const PIN_TMS: u8 = 1 << 1;
const PIN_TDI: u8 = 1 << 4;
const READ_CMD: u8 = 1 << 6;
// nCE, nCS and the output enable stay high
const OTHERS: u8 = (1 << 2) | (1 << 3) | (1 << 5);

// FTDI vendor requests
const SIO_RESET: u8 = 0;
const SIO_SET_LATENCY_TIMER: u8 = 9;
const REQTYPE_OUT: u8 = 0x40;

/// Bits clocked per USB round trip.  Each one needs two bytes out and one back, so this keeps
/// the answer within one FT245 receive buffer.
const CHUNK_BITS: usize = 128;

pub struct UsbBlaster {
    conn: UsbConn,
}

fn pins(tms: bool, tdi: bool) -> u8 {
    let mut byte = OTHERS;
    if tms {
        byte |= PIN_TMS;
    }
    if tdi {
        byte |= PIN_TDI;
    }
    byte
}

/// Drop the status header of every packet in `raw`.
fn strip_status(raw: &[u8], out: &mut Vec<u8>) {
    for packet in raw.chunks(PACKET) {
        if packet.len() > STATUS_BYTES {
            out.extend_from_slice(&packet[STATUS_BYTES..]);
        }
    }
}

impl UsbBlaster {
    /// Find a Blaster matching `criteria` (unset ids default to Altera's) and open it.
    pub fn connect(criteria: &UsbMatch) -> Result<Self> {
        let mut conn = UsbConn::connect(&criteria.or_defaults(VID, PID))?;
        conn.open()?;
        conn.write_control(REQTYPE_OUT, SIO_RESET, 0, 1, &[])?;
        conn.write_control(REQTYPE_OUT, SIO_SET_LATENCY_TIMER, 2, 1, &[])?;
        let blaster = Self { conn };
        blaster.conn.write_all(EP_OUT, &[pins(true, true)])?;
        log::info!("USB Blaster ready");
        Ok(blaster)
    }

    fn read_answer(&self, count: usize) -> Result<Vec<u8>> {
        let mut answer = Vec::with_capacity(count);
        let mut raw = [0u8; PACKET * 4];
        let mut idle = 0;
        while answer.len() < count {
            let n = self.conn.read_bulk(EP_IN, &mut raw)?;
            if n <= STATUS_BYTES {
                idle += 1;
                if idle > 100 {
                    return Err(Error::Transport(format!(
                        "USB Blaster returned {} of {count} bytes",
                        answer.len()
                    )));
                }
                continue;
            }
            strip_status(&raw[..n], &mut answer);
        }
        answer.truncate(count);
        Ok(answer)
    }
}

impl Cable for UsbBlaster {
    fn change_mode(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(tms.len() * 2 + 1);
        for x in tms.iter().by_vals() {
            buf.push(pins(x, tdi));
            buf.push(pins(x, tdi) | PIN_TCK);
        }
        if let Some(last) = tms.last().map(|b| *b) {
            buf.push(pins(last, tdi));
        }
        self.conn.write_all(EP_OUT, &buf)
    }

    fn read_write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        let mut out = BitVec::with_capacity(data.len());
        let total = data.len();

        for (n, chunk) in data.chunks(CHUNK_BITS).enumerate() {
            let mut buf = Vec::with_capacity(chunk.len() * 2 + 1);
            let mut tms = false;
            for (i, tdi) in chunk.iter().by_vals().enumerate() {
                tms = exit_after && n * CHUNK_BITS + i == total - 1;
                buf.push(pins(tms, tdi));
                buf.push(pins(tms, tdi) | PIN_TCK | READ_CMD);
            }
            buf.push(pins(tms, true));
            self.conn.write_all(EP_OUT, &buf)?;

            for byte in self.read_answer(chunk.len())? {
                out.push(byte & 1 != 0);
            }
        }
        Ok(out)
    }
}
