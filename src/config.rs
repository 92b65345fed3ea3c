//! TOML session files
//!
//! A session file names the cable, lists the parts on the chain (part 0 nearest TDO) and
//! optionally binds a bus:
//!
//! ```toml
//! [cable]
//! driver = "usbblaster"
//! desc = "USB-Blaster"
//!
//! [[part]]
//! name = "cpu"
//! idcode = 0x4ba00477
//! instruction_length = 4
//!
//! [[part.register]]
//! name = "BSR"
//! length = 24
//!
//! [[part.instruction]]
//! name = "EXTEST"
//! code = "0000"
//! register = "BSR"
//!
//! [[part.signal]]
//! name = "D0"
//! input = 0
//! output = 1
//! control = 2
//! disable = true
//!
//! [bus]
//! driver = "sram"
//! part = 0
//! address = ["A0", "A1"]
//! data = ["D0", "D1", "D2", "D3", "D4", "D5", "D6", "D7"]
//! cs = "nCS"
//! oe = "nOE"
//! we = "nWE"
//! ```
//!
//! The `sim` cable builds a simulated chain out of the part descriptions, with an SRAM of
//! `[sim] memory_size` bytes behind the bus.
use std::boxed::Box;
use std::fs;
use std::path::Path;
use std::string::String;
use std::vec::Vec;
use std::format;

use crate::bus::{self, BusParams, Endian, Timing};
use crate::cable::bitbang::{BitBang, Invert};
use crate::cable::{self, Cable, CableParams};
use crate::error::{Error, Result};
use crate::link::sim::{SimMemory, SimPart, SimTarget};
use crate::link::usbconn::UsbMatch;
use crate::part::{self, Control, Part, Signal};
use crate::session::Session;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionConfig {
    pub cable: CableConfig,
    #[serde(default)]
    pub part: Vec<PartConfig>,
    pub bus: Option<BusConfig>,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CableConfig {
    pub driver: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub desc: Option<String>,
    pub frequency: Option<u32>,
    #[serde(default = "default_divisor")]
    pub divisor: u32,
    #[serde(default)]
    pub invert: Vec<String>,
}

fn default_divisor() -> u32 {
    1
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PartConfig {
    pub name: String,
    pub idcode: Option<u32>,
    pub instruction_length: usize,
    /// Name of the boundary register, if the part has one.
    pub boundary: Option<String>,
    #[serde(default)]
    pub register: Vec<RegisterConfig>,
    #[serde(default)]
    pub instruction: Vec<InstructionConfig>,
    #[serde(default)]
    pub signal: Vec<SignalConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterConfig {
    pub name: String,
    pub length: usize,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct InstructionConfig {
    pub name: String,
    /// Opcode, MSB first.
    pub code: String,
    pub register: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SignalConfig {
    pub name: String,
    pub input: Option<usize>,
    pub output: Option<usize>,
    pub control: Option<usize>,
    /// Control cell value that turns the output off.
    #[serde(default)]
    pub disable: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_driver")]
    pub driver: String,
    #[serde(default)]
    pub part: usize,
    pub address: Vec<String>,
    pub data: Vec<String>,
    pub cs: String,
    pub oe: String,
    pub we: String,
    #[serde(default = "default_active_low")]
    pub active_low: bool,
    #[serde(default)]
    pub endian: Endian,
    #[serde(default)]
    pub timing: Timing,
}

fn default_bus_driver() -> String {
    "sram".into()
}

fn default_active_low() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Size of the simulated memory in bytes.
    pub memory_size: usize,
    /// Initial value of every memory byte.
    pub fill: u8,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { memory_size: 64 * 1024, fill: 0xff }
    }
}

impl PartConfig {
    pub fn build(&self) -> Result<Part> {
        let mut part = Part::new(&self.name, self.instruction_length)?;
        if let Some(idcode) = self.idcode {
            part = part.with_idcode(idcode);
        }
        for reg in &self.register {
            part.add_data_register(&reg.name, reg.length)?;
        }
        for instruction in &self.instruction {
            part.add_instruction(&instruction.name, &instruction.code, &instruction.register)?;
        }
        let boundary = self.boundary.as_deref().unwrap_or(part::BOUNDARY);
        if part.data_register(boundary).is_some() {
            part.set_boundary_register(boundary)?;
        } else if self.boundary.is_some() || !self.signal.is_empty() {
            return Err(Error::Config(format!("part `{}`: no boundary register `{boundary}`", self.name)));
        }
        for signal in &self.signal {
            part.add_signal(Signal {
                name: signal.name.clone(),
                input: signal.input,
                output: signal.output,
                control: signal.control.map(|cell| Control { cell, disable: signal.disable }),
            })?;
        }
        Ok(part)
    }
}

impl BusConfig {
    pub fn params(&self) -> BusParams {
        BusParams {
            part: self.part,
            address: self.address.clone(),
            data: self.data.clone(),
            cs: self.cs.clone(),
            oe: self.oe.clone(),
            we: self.we.clone(),
            active_low: self.active_low,
            endian: self.endian,
            timing: self.timing,
        }
    }
}

impl CableConfig {
    fn invert(&self) -> Result<Invert> {
        let mut invert = Invert::default();
        for name in &self.invert {
            match name.to_ascii_lowercase().as_str() {
                "tms" => invert.tms = true,
                "tck" => invert.tck = true,
                "tdi" => invert.tdi = true,
                "tdo" => invert.tdo = true,
                _ => return Err(Error::Config(format!("cannot invert unknown signal `{name}`"))),
            }
        }
        Ok(invert)
    }
}

impl SessionConfig {
    /// Load a session from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("cannot read `{}`: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse a session from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Build the simulated chain the `sim` cable drives.
    pub fn simulate(&self, parts: &[Part]) -> Result<SimTarget> {
        let mut sims: Vec<SimPart> = parts.iter().map(SimPart::from_part).collect();
        if let Some(bus) = &self.bus {
            let params = bus.params();
            let unit = (params.data.len() / 8).max(1);
            let fill = u32::from_le_bytes([self.sim.fill; 4]);
            let part = parts
                .get(params.part)
                .ok_or_else(|| Error::Config(format!("bus on part {}, but only {} parts", params.part, parts.len())))?;
            let memory = SimMemory::wired(part, &params, self.sim.memory_size / unit, fill)?;
            let sim = sims.remove(params.part);
            sims.insert(params.part, sim.with_memory(memory));
        }
        Ok(SimTarget::new(sims))
    }

    fn open_cable(&self, parts: &[Part]) -> Result<Box<dyn Cable>> {
        let config = &self.cable;
        if config.driver == "sim" {
            let cable = BitBang::new(self.simulate(parts)?)?
                .with_divisor(config.divisor)
                .with_invert(config.invert()?);
            return Ok(Box::new(cable));
        }
        let params = CableParams {
            usb: UsbMatch {
                vid: config.vid,
                pid: config.pid,
                desc: config.desc.clone(),
            },
            frequency: config.frequency,
        };
        cable::new_from_string(&config.driver, &params)
    }

    /// Open the cable and set up the chain and bus described by the file.
    pub fn build(&self) -> Result<Session> {
        let parts = self
            .part
            .iter()
            .map(PartConfig::build)
            .collect::<Result<Vec<_>>>()?;

        let mut session = Session::new();
        session.attach_cable(self.open_cable(&parts)?);
        for part in parts {
            session.add_part(part)?;
        }
        if let Some(config) = &self.bus {
            let driver = bus::new_from_string(&config.driver, config.params())?;
            session.attach_bus(driver)?;
        }
        log::info!(
            "session on `{}` cable with {} parts{}",
            self.cable.driver,
            self.part.len(),
            if self.bus.is_some() { " and a bus" } else { "" }
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::vec;

    const TWO_PARTS: &str = r#"
        [cable]
        driver = "sim"

        [[part]]
        name = "cpu"
        idcode = 0x4ba00477
        instruction_length = 4

        [[part.register]]
        name = "USER"
        length = 8

        [[part.instruction]]
        name = "USER"
        code = "0010"
        register = "USER"

        [[part]]
        name = "fpga"
        instruction_length = 8
    "#;

    #[test]
    fn parts_in_file_order() {
        let config = SessionConfig::from_toml(TWO_PARTS).unwrap();
        assert_eq!(config.part.len(), 2);
        assert_eq!(config.sim.memory_size, 64 * 1024);
        let mut session = config.build().unwrap();
        let chain = session.chain_mut().unwrap();
        assert_eq!(chain.parts()[0].name(), "cpu");
        assert_eq!(chain.parts()[1].instruction_length(), 8);
        chain.detect().unwrap();
        assert_eq!(chain.parts()[0].idcode(), Some(0x4ba0_0477));
    }

    #[test]
    fn bad_files() {
        let err = SessionConfig::from_toml("[cable]\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let unknown = SessionConfig::from_toml("[cable]\ndriver = \"parport\"\n").unwrap();
        assert_eq!(unknown.build().err().map(|e| e.kind()), Some(ErrorKind::Config));

        let bad_code = TWO_PARTS.replace("\"0010\"", "\"010\"");
        let config = SessionConfig::from_toml(&bad_code).unwrap();
        assert_eq!(config.build().err().map(|e| e.kind()), Some(ErrorKind::Config));

        let missing = SessionConfig::from_file("/nonexistent/session.toml").unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::Io);
    }

    #[test]
    fn inverted_signals() {
        let mut config = SessionConfig::from_toml(TWO_PARTS).unwrap();
        config.cable.invert = vec!["TCK".into(), "tdo".into()];
        let invert = config.cable.invert().unwrap();
        assert!(invert.tck && invert.tdo && !invert.tms);
        config.cable.invert.push("nTRST".into());
        assert!(config.cable.invert().is_err());
    }
}
