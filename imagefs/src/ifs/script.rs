//! Decoding of the boot script: a stream of variable-length command records stored as the
//! contents of the image's script inode.

use std::collections::HashMap;
use std::fmt;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::warn;

use super::dirent::basename;

const RECORD_HEADER_SIZE: usize = 4;

pub const SYSTEM_PARTITION_ID: u8 = 0;
pub const SYSTEM_PARTITION_NAME: &str = "System";

#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScriptType {
    External = 0,
    WaitFor = 1,
    Reopen = 2,
    DisplayMessage = 3,
    ProcmgrSymlink = 4,
    ExtSchedAps = 5,
}

bitflags! {
    pub struct ExternalFlags: u8 {
        const EXTSCHED = 0x01;
        const SESSION = 0x02;
        const SCHED_SET = 0x04;
        const CPU_SET = 0x08;
        const BACKGROUND = 0x20;
        const KDEBUG = 0x40;
    }
}

/// Partition names by id, owned by one decode of one script.
#[derive(Debug, Default, Clone)]
pub struct PartitionTable {
    names: HashMap<u8, String>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate(&mut self, id: u8, name: &str) {
        self.names.insert(id, name.to_string());
    }

    /// Name for a partition id, empty when the id has not been defined
    pub fn name(&self, id: u8) -> &str {
        self.names.get(&id).map(String::as_str).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A program started by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct External {
    pub cpu: u8,
    pub flags: ExternalFlags,
    pub aps_id: u8,
    /// Name of `aps_id` as known when the record was decoded
    pub aps_name: String,
    pub policy: u8,
    pub priority: u8,
    pub command: String,
    pub argv: Vec<String>,
    pub envv: Vec<String>,
}

impl External {
    /// `argv[0]` when it differs from the basename of the command.
    pub fn argv0_override(&self) -> Option<&str> {
        match self.argv.first() {
            Some(a0) if a0 != basename(&self.command) => Some(a0.as_str()),
            _ => None,
        }
    }

    fn has_options(&self) -> bool {
        self.argv0_override().is_some()
            || self.flags.intersects(
                ExternalFlags::SESSION
                    | ExternalFlags::KDEBUG
                    | ExternalFlags::SCHED_SET
                    | ExternalFlags::CPU_SET
                    | ExternalFlags::EXTSCHED,
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCommand {
    External(External),
    WaitFor { path: String, checks: u16 },
    Reopen { path: String, checks: u16 },
    DisplayMessage(String),
    ProcmgrSymlink { src: String, dst: String },
    ExtSchedAps { id: u8, policy: u8, budget: u8, critical: u16, name: String },
    Unknown { kind: u8 },
}

/// A decoded record together with its bytes as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRecord {
    /// Offset of the record within the script
    pub offset: usize,
    pub bytes: Vec<u8>,
    pub command: ScriptCommand,
}

/// Decode every record of a script. A record size of zero, or running out of bytes on a record
/// boundary, ends the script. A malformed record also ends it: the records before it are kept
/// and the anomaly is logged.
pub fn decode(script: &[u8]) -> Vec<ScriptRecord> {
    let mut table = PartitionTable::new();
    decode_with(script, &mut table)
}

pub fn decode_with(script: &[u8], table: &mut PartitionTable) -> Vec<ScriptRecord> {
    let mut records = Vec::new();
    let mut off = 0;
    while off + RECORD_HEADER_SIZE <= script.len() {
        let size = script[off] as usize | (script[off + 1] as usize) << 8;
        if size == 0 {
            break;
        }
        if size < RECORD_HEADER_SIZE || off + size > script.len() {
            warn!(offset = off, size, "malformed script record, rest of script ignored");
            break;
        }
        let bytes = &script[off..off + size];
        let command = decode_command(bytes, table);
        records.push(ScriptRecord { offset: off, bytes: bytes.to_vec(), command });
        off += size;
    }
    records
}

fn decode_command(rec: &[u8], table: &mut PartitionTable) -> ScriptCommand {
    let kind = rec[2];
    let byte = |i: usize| rec.get(i).copied().unwrap_or(0);
    match ScriptType::try_from(kind) {
        Ok(ScriptType::External) => {
            let aps_id = byte(6);
            let argc = byte(10) as usize;
            let envc = byte(11) as usize;
            let mut strings = Strings::new(rec, 12);
            let command = strings.next_string();
            let argv = (0..argc).map(|_| strings.next_string()).collect();
            let envv = (0..envc).map(|_| strings.next_string()).collect();
            ScriptCommand::External(External {
                cpu: byte(4),
                flags: ExternalFlags::from_bits_truncate(byte(5)),
                aps_id,
                aps_name: table.name(aps_id).to_string(),
                policy: byte(8),
                priority: byte(9),
                command,
                argv,
                envv,
            })
        }
        Ok(t @ (ScriptType::WaitFor | ScriptType::Reopen)) => {
            let checks = byte(4) as u16 | (byte(5) as u16) << 8;
            let path = Strings::new(rec, 6).next_string();
            if t == ScriptType::WaitFor {
                ScriptCommand::WaitFor { path, checks }
            } else {
                ScriptCommand::Reopen { path, checks }
            }
        }
        Ok(ScriptType::DisplayMessage) => ScriptCommand::DisplayMessage(Strings::new(rec, 4).next_string()),
        Ok(ScriptType::ProcmgrSymlink) => {
            let mut s = Strings::new(rec, 4);
            let src = s.next_string();
            let dst = s.next_string();
            ScriptCommand::ProcmgrSymlink { src, dst }
        }
        Ok(ScriptType::ExtSchedAps) => {
            if table.is_empty() {
                table.associate(SYSTEM_PARTITION_ID, SYSTEM_PARTITION_NAME);
            }
            let id = byte(4);
            let name = Strings::new(rec, 9).next_string();
            table.associate(id, &name);
            ScriptCommand::ExtSchedAps {
                id,
                policy: byte(5),
                budget: byte(6),
                critical: (byte(7) as u16) << 8 | byte(8) as u16,
                name,
            }
        }
        Err(_) => ScriptCommand::Unknown { kind },
    }
}

// NUL-terminated strings packed back to back
struct Strings<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Strings<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Strings { buf, pos }
    }

    fn next_string(&mut self) -> String {
        let rest = self.buf.get(self.pos..).unwrap_or(&[]);
        let len = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        self.pos += len + 1;
        String::from_utf8_lossy(&rest[..len]).into_owned()
    }
}

impl fmt::Display for External {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_options() {
            write!(f, "[ ")?;
            if let Some(a0) = self.argv0_override() {
                write!(f, "argv0={} ", a0)?;
            }
            if self.flags.contains(ExternalFlags::SESSION) {
                write!(f, "+session ")?;
            }
            if self.flags.contains(ExternalFlags::KDEBUG) {
                write!(f, "+debug ")?;
            }
            if self.flags.contains(ExternalFlags::SCHED_SET) {
                write!(f, "priority={}", self.priority)?;
                match self.policy {
                    0 => {}
                    1 => write!(f, "f")?,
                    2 => write!(f, "r")?,
                    3 => write!(f, "o")?,
                    p => write!(f, "?{}?", p)?,
                }
                write!(f, " ")?;
            }
            if self.flags.contains(ExternalFlags::CPU_SET) {
                write!(f, "cpu={} ", self.cpu)?;
            }
            if self.flags.contains(ExternalFlags::EXTSCHED) {
                write!(f, "sched_aps={} ", self.aps_name)?;
            }
            write!(f, "] ")?;
        }
        for env in &self.envv {
            write!(f, "{} ", env)?;
        }
        write!(f, "{}", self.command)?;
        for arg in self.argv.iter().skip(1) {
            write!(f, " {}", arg)?;
        }
        if self.flags.contains(ExternalFlags::BACKGROUND) {
            write!(f, " &")?;
        }
        Ok(())
    }
}

impl fmt::Display for ScriptCommand {
    /// One line of build-file script text, without the line terminator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptCommand::External(ext) => write!(f, "{}", ext),
            ScriptCommand::WaitFor { path, checks } | ScriptCommand::Reopen { path, checks } => {
                let verb = if matches!(self, ScriptCommand::WaitFor { .. }) { "waitfor" } else { "reopen" };
                write!(f, "{} {}", verb, path)?;
                if *checks != 0 {
                    write!(f, " {}.{}", checks / 10, checks % 10)?;
                }
                Ok(())
            }
            ScriptCommand::DisplayMessage(msg) => write!(f, "display_msg {}", msg.trim_end_matches('\n')),
            ScriptCommand::ProcmgrSymlink { src, dst } => write!(f, "procmgr_symlink \"{}\" \"{}\"", src, dst),
            ScriptCommand::ExtSchedAps { budget, critical, name, .. } => {
                write!(f, "sched_aps {} {} {}", name, budget, critical)
            }
            ScriptCommand::Unknown { kind } => write!(f, "Unknown type {}", kind),
        }
    }
}

impl fmt::Display for ScriptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.command, f)
    }
}

/// Render a decoded script as text, one command per line.
pub fn render(records: &[ScriptRecord]) -> String {
    let mut s = String::new();
    for r in records {
        s.push_str(&r.to_string());
        s.push('\n');
    }
    s
}
