//! Line-oriented commands on a [`Session`].  Every command checks its parameter count and
//! parses its arguments before it touches the chain, so a malformed line never clocks the TAP.
//!
//! `params[0]` is always the command name, and counts toward the number of parameters.
use std::fs::File;
use std::io::{Read, Write};
use std::format;
use std::string::String;
use std::vec::Vec;

use crate::error::{Error, Result};
use crate::part::{format_code, parse_code};
use crate::session::Session;
use crate::statemachine::Register;

pub type CommandFn = fn(&mut Session, &[&str], &mut dyn Write) -> Result<()>;

pub struct CommandInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
    pub run: CommandFn,
}

pub static COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        name: "reset",
        description: "reset the JTAG chain",
        usage: "reset",
        run: cmd_reset,
    },
    CommandInfo {
        name: "bypass",
        description: "reset the chain and put every part in BYPASS",
        usage: "bypass",
        run: cmd_bypass,
    },
    CommandInfo {
        name: "detect",
        description: "detect the parts on the chain",
        usage: "detect [IRLEN...]",
        run: cmd_detect,
    },
    CommandInfo {
        name: "instruction",
        description: "queue an instruction for a part, loaded by the next `shift ir`",
        usage: "instruction PART NAME",
        run: cmd_instruction,
    },
    CommandInfo {
        name: "shift",
        description: "shift the instruction or data registers of the whole chain",
        usage: "shift ir|dr",
        run: cmd_shift,
    },
    CommandInfo {
        name: "dr",
        description: "show the last capture of a part's data register, or set what it shifts in",
        usage: "dr PART [BITS]",
        run: cmd_dr,
    },
    CommandInfo {
        name: "signal",
        description: "show a boundary signal, or set it for the next data shift",
        usage: "signal PART NAME [0|1|Z]",
        run: cmd_signal,
    },
    CommandInfo {
        name: "idle",
        description: "spend clock cycles in Run-Test/Idle",
        usage: "idle N",
        run: cmd_idle,
    },
    CommandInfo {
        name: "readmem",
        description: "read bus memory into a file",
        usage: "readmem ADDR LEN FILENAME",
        run: cmd_readmem,
    },
    CommandInfo {
        name: "writemem",
        description: "write a file to bus memory",
        usage: "writemem ADDR LEN FILENAME",
        run: cmd_writemem,
    },
    CommandInfo {
        name: "help",
        description: "list commands, or show the usage of one",
        usage: "help [COMMAND]",
        run: cmd_help,
    },
];

pub fn find(name: &str) -> Option<&'static CommandInfo> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// Decimal, or hexadecimal with a `0x` prefix.
pub fn parse_number(s: &str) -> Result<u64> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| Error::Syntax(format!("`{s}' is not a number")))
}

fn parse_usize(s: &str) -> Result<usize> {
    usize::try_from(parse_number(s)?).map_err(|_| Error::Syntax(format!("`{s}' is too large")))
}

fn check_params(params: &[&str], counts: &[usize]) -> Result<()> {
    if counts.contains(&params.len()) {
        return Ok(());
    }
    Err(Error::Syntax(format!(
        "{}: #parameters should be {}, not {}",
        params[0],
        counts.iter().map(|c| format!("{c}")).collect::<Vec<_>>().join(" or "),
        params.len()
    )))
}

/// Split `line` into words and run the command it names.  Blank lines and `#` comments do
/// nothing.
pub fn run_line(session: &mut Session, line: &str, out: &mut dyn Write) -> Result<()> {
    let line = line.split('#').next().unwrap_or("");
    let params: Vec<&str> = line.split_whitespace().collect();
    let Some(name) = params.first() else {
        return Ok(());
    };
    let command = find(name).ok_or_else(|| Error::Syntax(format!("{name}: unknown command, try `help'")))?;
    log::debug!("running `{}`", params.join(" "));
    (command.run)(session, &params, out)
}

/// Run a script of lines.  Without `keep_going` the first failing command ends the run;
/// otherwise each failure goes to `report` and the next line runs.  Returns how many commands
/// failed.  A line that cannot be read always ends the run.
pub fn run_script<I>(
    session: &mut Session,
    lines: I,
    out: &mut dyn Write,
    keep_going: bool,
    mut report: impl FnMut(&Error),
) -> Result<usize>
where
    I: IntoIterator<Item = Result<String>>,
{
    let mut failed = 0;
    for line in lines {
        let result = run_line(session, &line?, out);
        out.flush()?;
        if let Err(err) = result {
            if !keep_going {
                return Err(err);
            }
            report(&err);
            failed += 1;
        }
    }
    Ok(failed)
}

fn cmd_reset(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[1])?;
    session.reset()
}

fn cmd_bypass(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[1])?;
    session.chain_mut()?.reset_bypass()
}

fn cmd_detect(session: &mut Session, params: &[&str], out: &mut dyn Write) -> Result<()> {
    let lengths = params[1..].iter().map(|p| parse_usize(p)).collect::<Result<Vec<_>>>()?;
    // The parts change under any bound bus
    session.detach_bus();
    let chain = session.chain_mut()?;
    if lengths.is_empty() {
        chain.detect()?;
    } else {
        chain.detect_with_lengths(&lengths)?;
    }
    for (i, part) in chain.parts().iter().enumerate() {
        let ir = part.instruction_length();
        match part.idcode() {
            Some(idcode) => writeln!(out, "Part {i}: IDCODE 0x{idcode:08x}, IR length {ir}")?,
            None => writeln!(out, "Part {i}: no IDCODE, IR length {ir}")?,
        }
    }
    Ok(())
}

fn cmd_instruction(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[3])?;
    let index = parse_usize(params[1])?;
    session.chain_mut()?.part_mut(index)?.set_instruction(params[2])
}

fn cmd_shift(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[2])?;
    let reg = match params[1] {
        "ir" => Register::Instruction,
        "dr" => Register::Data,
        other => return Err(Error::Syntax(format!("shift: `{other}' is neither ir nor dr"))),
    };
    let chain = session.chain_mut()?;
    match reg {
        Register::Instruction => chain.shift_instructions()?,
        Register::Data => chain.shift_data_registers()?,
    };
    Ok(())
}

fn cmd_dr(session: &mut Session, params: &[&str], out: &mut dyn Write) -> Result<()> {
    check_params(params, &[2, 3])?;
    let index = parse_usize(params[1])?;
    let bits = params
        .get(2)
        .map(|b| parse_code(b).map_err(|_| Error::Syntax(format!("dr: bad bit string `{b}'"))))
        .transpose()?;

    let part = session.chain_mut()?.part_mut(index)?;
    let reg = part.selected_register_mut();
    match bits {
        Some(bits) => {
            if bits.len() != reg.len() {
                return Err(Error::Syntax(format!(
                    "dr: {} has {} bits, not {}",
                    reg.name(),
                    reg.len(),
                    bits.len()
                )));
            }
            reg.input_mut().copy_from_bitslice(&bits);
        }
        None => writeln!(out, "{} ({}): {}", reg.name(), reg.len(), format_code(reg.output()))?,
    }
    Ok(())
}

fn cmd_signal(session: &mut Session, params: &[&str], out: &mut dyn Write) -> Result<()> {
    check_params(params, &[3, 4])?;
    let index = parse_usize(params[1])?;
    let level = match params.get(3).copied() {
        None => None,
        Some("0") => Some((true, false)),
        Some("1") => Some((true, true)),
        Some("Z") | Some("z") => Some((false, false)),
        Some(other) => return Err(Error::Syntax(format!("signal: `{other}' is not 0, 1 or Z"))),
    };

    let part = session.chain_mut()?.part_mut(index)?;
    match level {
        Some((drive, value)) => part.set_signal(params[2], drive, value),
        None => {
            let value = part.get_signal(params[2])?;
            writeln!(out, "{} = {}", params[2], u8::from(value))?;
            Ok(())
        }
    }
}

fn cmd_idle(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[2])?;
    let cycles = parse_usize(params[1])?;
    session.chain_mut()?.idle(cycles)
}

fn cmd_readmem(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[4])?;
    if session.bus().is_none() {
        return Err(Error::IllegalState("Bus missing".into()));
    }
    let address = parse_number(params[1])?;
    let len = parse_usize(params[2])?;
    let path = params[3];

    let data = session.read_memory(address, len)?;
    let mut file = File::create(path).map_err(|e| Error::Io(format!("Unable to create file `{path}': {e}")))?;
    file.write_all(&data)
        .map_err(|e| Error::Io(format!("Unable to write file `{path}': {e}")))?;
    log::info!("read {len} bytes at 0x{address:x} into {path}");
    Ok(())
}

fn cmd_writemem(session: &mut Session, params: &[&str], _out: &mut dyn Write) -> Result<()> {
    check_params(params, &[4])?;
    if session.bus().is_none() {
        return Err(Error::IllegalState("Bus missing".into()));
    }
    let address = parse_number(params[1])?;
    let len = parse_usize(params[2])?;
    let path = params[3];

    let file = File::open(path).map_err(|e| Error::Io(format!("Unable to open file `{path}': {e}")))?;
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|_| Error::OutOfMemory(len))?;
    file.take(len as u64)
        .read_to_end(&mut data)
        .map_err(|e| Error::Io(format!("Unable to read file `{path}': {e}")))?;
    if data.len() < len {
        log::warn!("{path} holds only {} of {len} bytes", data.len());
    }
    session.write_memory(address, &data)?;
    log::info!("wrote {} bytes at 0x{address:x} from {path}", data.len());
    Ok(())
}

fn cmd_help(_session: &mut Session, params: &[&str], out: &mut dyn Write) -> Result<()> {
    check_params(params, &[1, 2])?;
    if let Some(name) = params.get(1) {
        let command = find(name).ok_or_else(|| Error::Syntax(format!("help: unknown command `{name}'")))?;
        writeln!(out, "Usage: {}\n{}", command.usage, command.description)?;
        return Ok(());
    }
    let width = COMMANDS.iter().map(|c| c.name.len()).max().unwrap_or(0);
    for command in COMMANDS {
        writeln!(out, "{:width$}  {}", command.name, command.description)?;
    }
    Ok(())
}
