use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use jtag_chain::cmd::run_line;
use jtag_chain::config::SessionConfig;
use jtag_chain::error::{ErrorKind, Result};
use jtag_chain::session::Session;
use jtag_chain::statemachine::JtagState;

/// A CPU with an IDCODE nearest TDO, and behind it a board controller whose pins carry an SRAM
/// with 16 address lines and `data_lines` data lines.  Every signal has an input, an output and
/// a control cell.
fn board(data_lines: usize, with_bus: bool) -> String {
    let mut signals: Vec<String> = (0..16).map(|i| format!("A{i}")).collect();
    signals.extend((0..data_lines).map(|i| format!("D{i}")));
    signals.extend(["nCS", "nOE", "nWE"].map(String::from));

    let mut toml = String::from(
        r#"
[cable]
driver = "sim"

[sim]
memory_size = 65536
fill = 0xff

[[part]]
name = "cpu"
idcode = 0x4ba00477
instruction_length = 4

[[part.instruction]]
name = "IDCODE"
code = "1110"
register = "IDCODE"

[[part]]
name = "board"
instruction_length = 8

[[part.register]]
name = "BSR"
"#,
    );
    writeln!(toml, "length = {}", 3 * signals.len()).unwrap();
    for (name, code) in [("EXTEST", "00000000"), ("SAMPLE/PRELOAD", "00000001")] {
        write!(toml, "\n[[part.instruction]]\nname = \"{name}\"\ncode = \"{code}\"\nregister = \"BSR\"\n").unwrap();
    }
    for (i, name) in signals.iter().enumerate() {
        write!(
            toml,
            "\n[[part.signal]]\nname = \"{name}\"\ninput = {}\noutput = {}\ncontrol = {}\ndisable = true\n",
            3 * i,
            3 * i + 1,
            3 * i + 2
        )
        .unwrap();
    }

    if with_bus {
        let quoted = |names: &[String]| names.iter().map(|n| format!("\"{n}\"")).collect::<Vec<_>>().join(", ");
        write!(
            toml,
            "\n[bus]\npart = 1\naddress = [{}]\ndata = [{}]\ncs = \"nCS\"\noe = \"nOE\"\nwe = \"nWE\"\n",
            quoted(&signals[..16]),
            quoted(&signals[16..16 + data_lines])
        )
        .unwrap();
    }
    toml
}

fn session(data_lines: usize, with_bus: bool) -> Session {
    let config = SessionConfig::from_toml(&board(data_lines, with_bus)).unwrap();
    let mut session = config.build().unwrap();
    run(&mut session, "reset").unwrap();
    session
}

fn run(session: &mut Session, line: &str) -> Result<String> {
    let mut out = Vec::new();
    run_line(session, line, &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

fn readmem(session: &mut Session, address: u64, len: usize, path: &Path) -> Result<Vec<u8>> {
    run(session, &format!("readmem 0x{address:x} {len} {}", path.display()))?;
    Ok(fs::read(path).unwrap())
}

#[test]
fn bus_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bin");
    let output = dir.path().join("out.bin");
    let mut session = session(8, true);

    for address in [0x0u64, 0x1000] {
        for len in [1usize, 4, 256] {
            let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(7) ^ (address >> 8) as u8).collect();
            fs::write(&input, &data).unwrap();
            run(&mut session, &format!("writemem 0x{address:x} {len} {}", input.display())).unwrap();
            assert_eq!(readmem(&mut session, address, len, &output).unwrap(), data, "{len} bytes at 0x{address:x}");
        }
    }
    // Memory past the last write kept its fill
    assert_eq!(readmem(&mut session, 0x1100, 2, &output).unwrap(), [0xff, 0xff]);
}

#[test]
fn readmem_without_bus_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    let mut session = session(8, false);

    let err = run(&mut session, &format!("readmem 0x100 16 {}", path.display())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    assert!(!path.exists());
}

#[test]
fn unaligned_write_on_a_wide_bus() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bin");
    let output = dir.path().join("out.bin");
    let mut session = session(16, true);

    fs::write(&input, [0x11, 0x22, 0x33]).unwrap();
    run(&mut session, &format!("writemem 0x1001 3 {}", input.display())).unwrap();
    assert_eq!(
        readmem(&mut session, 0x1000, 6, &output).unwrap(),
        [0xff, 0x11, 0x22, 0x33, 0xff, 0xff]
    );
    assert_eq!(readmem(&mut session, 0x1003, 1, &output).unwrap(), [0x33]);
}

#[test]
fn short_file_writes_what_it_has() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.bin");
    let output = dir.path().join("out.bin");
    let mut session = session(8, true);

    fs::write(&input, [0xaa, 0x55]).unwrap();
    run(&mut session, &format!("writemem 0x20 4 {}", input.display())).unwrap();
    assert_eq!(readmem(&mut session, 0x20, 4, &output).unwrap(), [0xaa, 0x55, 0xff, 0xff]);
}

#[test]
fn memory_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    let mut session = session(8, true);

    // 16 address lines of bytes end at 0xffff
    let err = run(&mut session, &format!("readmem 0xffff 2 {}", path.display())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);

    let missing = dir.path().join("missing.bin");
    let err = run(&mut session, &format!("writemem 0 4 {}", missing.display())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(err.to_string().starts_with("Unable to open file"));

    let err = run(&mut session, "readmem 0x0 lots out.bin").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
}

#[test]
fn reset_is_idempotent() {
    let mut session = session(8, false);
    run(&mut session, "reset").unwrap();
    run(&mut session, "reset").unwrap();
    assert_eq!(session.chain().unwrap().state(), Some(JtagState::Idle));
}

#[test]
fn idcode_through_commands() {
    let mut session = session(8, true);
    // Test-Logic-Reset already selected IDCODE on the cpu, BYPASS on the board
    run(&mut session, "shift dr").unwrap();
    assert_eq!(run(&mut session, "dr 0").unwrap(), format!("IDCODE (32): {:032b}\n", 0x4ba0_0477u32));

    run(&mut session, "instruction 1 SAMPLE/PRELOAD").unwrap();
    run(&mut session, "shift ir").unwrap();
    let chain = session.chain().unwrap();
    assert_eq!(chain.parts()[0].active_instruction().map(|i| i.name()), Some("BYPASS"));
    assert_eq!(chain.parts()[1].active_instruction().map(|i| i.name()), Some("SAMPLE/PRELOAD"));

    // Nothing drives the pins, so every input samples the pull-up
    run(&mut session, "shift dr").unwrap();
    assert_eq!(run(&mut session, "signal 1 D0").unwrap(), "D0 = 1\n");
}

#[test]
fn detect_replaces_parts() {
    let mut session = session(8, true);
    let text = run(&mut session, "detect").unwrap();
    assert_eq!(text, "Part 0: IDCODE 0x4ba00477, IR length 4\nPart 1: no IDCODE, IR length 8\n");
    // The bus referred to the old parts
    assert!(session.bus().is_none());
    assert_eq!(session.chain().unwrap().parts()[1].name(), "part1");
}
