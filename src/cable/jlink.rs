//! Implement the `Cable` trait for "jlink" compatible hardware adapters
use std::vec::Vec;
use std::{format, vec};

use bitvec::prelude::*;
use rusb::constants::LIBUSB_CLASS_VENDOR_SPEC;
use rusb::Direction;

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::link::usbconn::{UsbConn, UsbMatch};
use crate::link::Link;

const VID: u16 = 0x1366;
const PID: u16 = 0x0105;

const CMD_SET_SPEED: u8 = 0x05;
const CMD_GET_STATE: u8 = 0x07;
const CMD_HW_JTAG: u8 = 0xcd;
const CMD_SELECT_IF: u8 = 0xc7;
const CMD_RESET_TARGET: u8 = 0xdc;
const CMD_RELEASE_TARGET: u8 = 0xdd;
const CMD_TRST_LOW: u8 = 0xde;
const CMD_TRST_HIGH: u8 = 0xdf;

/// Longest tap sequence sent in one command.
const MAX_SEQUENCE_BITS: usize = 2048;

/// Below this the target is probably unpowered.
const MIN_VREF_MV: u16 = 1500;

pub struct JLink {
    conn: UsbConn,
    // queued bytes to send
    buffer: Vec<u8>,
    // number of bytes we'll receive after sending the above
    recv_bytes: usize,
    read_endpoint: u8,
    write_endpoint: u8,
}

/// The vendor-specific interface and its bulk endpoints.
fn find_endpoints(conn: &UsbConn) -> Result<(u8, u8, u8)> {
    let config = conn.device().active_config_descriptor()?;
    for i in config.interfaces() {
        for d in i.descriptors() {
            if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC
                || d.sub_class_code() != LIBUSB_CLASS_VENDOR_SPEC
                || d.num_endpoints() < 2
            {
                continue;
            }

            let mut read_endpoint = None;
            let mut write_endpoint = None;
            for e in d.endpoint_descriptors() {
                match e.direction() {
                    Direction::In => read_endpoint = Some(e.address()),
                    Direction::Out => write_endpoint = Some(e.address()),
                }
            }

            if let (Some(read), Some(write)) = (read_endpoint, write_endpoint) {
                return Ok((d.interface_number(), read, write));
            }
        }
    }
    Err(Error::NotFound("J-Link has no vendor-specific interface".into()))
}

/// Pack bits into the little-endian byte stream the adapter expects.
fn pack(bits: &BitSlice<u8, Lsb0>) -> Vec<u8> {
    let mut bv: BitVec<u8, Lsb0> = bits.iter().by_vals().collect();
    bv.set_uninitialized(false);
    bv.into_vec()
}

/// The HW_JTAG command for one sequence: bit count, then TMS and TDI packed LSB first.
fn hw_jtag(tms: &BitSlice<u8, Lsb0>, tdi: &BitSlice<u8, Lsb0>) -> Vec<u8> {
    debug_assert_eq!(tms.len(), tdi.len());
    let bits = tms.len() as u16;
    let tms = pack(tms);
    let tdi = pack(tdi);
    let mut frame = Vec::with_capacity(3 + tms.len() * 2);
    frame.push(CMD_HW_JTAG);
    frame.extend_from_slice(&bits.to_le_bytes());
    frame.extend_from_slice(&tms);
    frame.extend_from_slice(&tdi);
    frame
}

impl JLink {
    /// Find a J-Link matching `criteria`, claim it and set TCK to `clock` hertz.
    pub fn connect(criteria: &UsbMatch, clock: u32) -> Result<Self> {
        let conn = UsbConn::connect(&criteria.or_defaults(VID, PID))?;
        let (interface, read_endpoint, write_endpoint) = find_endpoints(&conn)?;
        let mut conn = conn.with_interface(interface);
        conn.open()?;

        // Throw away anything left over from an earlier session
        let mut buf = [0; 2];
        let _ = conn.read_bulk(read_endpoint, &mut buf);

        let mut jlink = Self {
            conn,
            buffer: vec![],
            recv_bytes: 0,
            read_endpoint,
            write_endpoint,
        };

        let vref = jlink.get_status()?;
        log::info!("J-Link target voltage {vref} mV");
        jlink.set_clock(clock);
        jlink.set_interface(0)?;
        jlink.deassert_trst();
        jlink.deassert_srst();
        jlink.flush()?;
        Ok(jlink)
    }

    fn send_command(&mut self, cmd: u8, data: &[u8]) {
        self.buffer.push(cmd);
        self.buffer.extend_from_slice(data);
    }

    fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        // Submit any pending writes
        if !self.buffer.is_empty() {
            self.conn.write_all(self.write_endpoint, &self.buffer)?;
            self.buffer.clear();
        }

        let mut remaining = len + self.recv_bytes;
        let mut data = Vec::with_capacity(remaining);

        while remaining > 0 {
            let mut buffer = vec![0; remaining];
            let n = self.conn.read_bulk(self.read_endpoint, &mut buffer)?;
            if n == 0 {
                return Err(Error::Transport("J-Link stopped answering".into()));
            }
            data.extend_from_slice(&buffer[..n.min(remaining)]);
            remaining -= n.min(remaining);
        }

        // Don't return any of the data from the pending write that we didn't care about
        let data = data.split_off(self.recv_bytes);
        self.recv_bytes = 0;
        Ok(data)
    }

    /// Ask for the adapter state and return the target voltage in millivolts.
    pub fn get_status(&mut self) -> Result<u16> {
        self.send_command(CMD_GET_STATE, &[]);
        let data = self.read_data(8)?;

        let vref = u16::from_le_bytes([data[0], data[1]]);
        if vref < MIN_VREF_MV {
            return Err(Error::Transport(format!(
                "J-Link target voltage {vref} mV is too low, possibly unpowered or disconnected"
            )));
        }
        Ok(vref)
    }

    pub fn set_clock(&mut self, clock: u32) {
        let khz = u16::try_from(clock / 1000).unwrap_or(u16::MAX).max(1);
        self.send_command(CMD_SET_SPEED, &khz.to_le_bytes());
    }

    pub fn set_interface(&mut self, intf: u8) -> Result<()> {
        self.send_command(CMD_SELECT_IF, &[intf]);
        self.read_data(4).map(|_| ())
    }

    pub fn assert_srst(&mut self) {
        self.send_command(CMD_RESET_TARGET, &[]);
    }

    pub fn deassert_srst(&mut self) {
        self.send_command(CMD_RELEASE_TARGET, &[]);
    }

    pub fn assert_trst(&mut self) {
        self.send_command(CMD_TRST_LOW, &[]);
    }

    pub fn deassert_trst(&mut self) {
        self.send_command(CMD_TRST_HIGH, &[]);
    }

    /// Queue one tap sequence; returns the number of TDO bytes it will produce.
    fn tap_sequence(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: &BitSlice<u8, Lsb0>) -> usize {
        let frame = hw_jtag(tms, tdi);
        self.buffer.extend_from_slice(&frame);
        tms.len().div_ceil(8)
    }
}

impl Cable for JLink {
    fn change_mode(&mut self, tms: &BitSlice<u8, Lsb0>, tdi: bool) -> Result<()> {
        for chunk in tms.chunks(MAX_SEQUENCE_BITS) {
            let tdi = BitVec::<u8, Lsb0>::repeat(tdi, chunk.len());
            // We don't care about the returned bytes, so read them whenever we do the next read
            self.recv_bytes += self.tap_sequence(chunk, &tdi);
        }
        Ok(())
    }

    fn read_write_data(&mut self, data: &BitSlice<u8, Lsb0>, exit_after: bool) -> Result<BitVec<u8, Lsb0>> {
        let mut out = BitVec::with_capacity(data.len());
        let total = data.len();
        let mut done = 0;

        for chunk in data.chunks(MAX_SEQUENCE_BITS) {
            let mut tms = bitvec![u8, Lsb0; 0; chunk.len()];
            if exit_after && done + chunk.len() == total {
                tms.set(chunk.len() - 1, true);
            }
            let bytes = self.tap_sequence(&tms, chunk);
            let tdo = BitVec::<u8, Lsb0>::from_vec(self.read_data(bytes)?);
            out.extend_from_bitslice(&tdo[..chunk.len()]);
            done += chunk.len();
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<()> {
        self.read_data(0).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_clears_tail() {
        let bits = bits![u8, Lsb0; 1, 0, 1, 1, 1, 1, 1, 1, 1, 1];
        assert_eq!(pack(&bits[..9]), vec![0xfd, 0x01]);
    }

    #[test]
    fn hw_jtag_frame() {
        let tms = bits![u8, Lsb0; 1, 1, 0, 1, 0, 0, 0, 0, 0, 1];
        let tdi = bits![u8, Lsb0; 0, 0, 0, 0, 1, 1, 1, 1, 1, 1];
        assert_eq!(hw_jtag(tms, tdi), vec![0xcd, 10, 0, 0x0b, 0x02, 0xf0, 0x03]);
    }
}
