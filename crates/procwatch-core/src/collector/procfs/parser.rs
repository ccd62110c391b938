//! Parsers for `/proc/[pid]/status`, `/proc/[pid]/io` and `/proc/[pid]/stat`.
//!
//! These are pure functions over file contents, so they are tested with string
//! inputs. Every field the sampler needs is required: a missing or malformed
//! field is reported as a [`ParseError`] naming it, never silently defaulted.

use std::collections::HashMap;

use thiserror::Error;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{file}: missing field `{field}`")]
    MissingField {
        file: &'static str,
        field: &'static str,
    },
    #[error("{file}: invalid value {value:?} for `{field}`")]
    InvalidValue {
        file: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("stat: {0}")]
    MalformedStat(String),
}

// 1-based field positions in `/proc/[pid]/stat`, as numbered in proc(5).
const STAT_MINFLT: usize = 10;
const STAT_MAJFLT: usize = 12;
const STAT_UTIME: usize = 14;
const STAT_STIME: usize = 15;
const STAT_NUM_THREADS: usize = 20;
/// Position of the first field after `(comm)`.
const STAT_STATE: usize = 3;

/// Splits `key: value` lines on the first colon.
///
/// Keys are lowercased and values trimmed. Lines without a colon are ignored;
/// later duplicates win.
pub fn parse_key_values(content: &str) -> HashMap<String, &str> {
    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim()))
        .collect()
}

/// Parses the leading unsigned integer of a value, ignoring any unit suffix
/// (`"40 kB"` → 40).
pub fn leading_u64(value: &str) -> Option<u64> {
    let value = value.trim_start();
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok()
}

fn required<'a>(
    fields: &HashMap<String, &'a str>,
    file: &'static str,
    field: &'static str,
) -> Result<&'a str, ParseError> {
    fields
        .get(field)
        .copied()
        .ok_or(ParseError::MissingField { file, field })
}

fn required_u64(
    fields: &HashMap<String, &str>,
    file: &'static str,
    field: &'static str,
) -> Result<u64, ParseError> {
    let raw = required(fields, file, field)?;
    leading_u64(raw).ok_or_else(|| ParseError::InvalidValue {
        file,
        field,
        value: raw.to_string(),
    })
}

fn required_u32(
    fields: &HashMap<String, &str>,
    file: &'static str,
    field: &'static str,
) -> Result<u32, ParseError> {
    let value = required_u64(fields, file, field)?;
    u32::try_from(value).map_err(|_| ParseError::InvalidValue {
        file,
        field,
        value: value.to_string(),
    })
}

/// Parsed data from `/proc/[pid]/status`.
///
/// Memory values are in kilobytes as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub name: String,
    pub pid: u32,
    pub ppid: u32,
    pub rss_anon_kb: u64,
    pub rss_file_kb: u64,
    pub vm_size_kb: u64,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
}

/// Parses `/proc/[pid]/status` content.
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    const FILE: &str = "status";
    let fields = parse_key_values(content);

    Ok(ProcStatus {
        name: required(&fields, FILE, "name")?.to_string(),
        pid: required_u32(&fields, FILE, "pid")?,
        ppid: required_u32(&fields, FILE, "ppid")?,
        rss_anon_kb: required_u64(&fields, FILE, "rssanon")?,
        rss_file_kb: required_u64(&fields, FILE, "rssfile")?,
        vm_size_kb: required_u64(&fields, FILE, "vmsize")?,
        voluntary_ctxt_switches: required_u64(&fields, FILE, "voluntary_ctxt_switches")?,
        nonvoluntary_ctxt_switches: required_u64(&fields, FILE, "nonvoluntary_ctxt_switches")?,
    })
}

/// Parsed data from `/proc/[pid]/io`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcIo {
    pub rchar: u64,
    pub wchar: u64,
    pub syscr: u64,
    pub syscw: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Parses `/proc/[pid]/io` content.
pub fn parse_proc_io(content: &str) -> Result<ProcIo, ParseError> {
    const FILE: &str = "io";
    let fields = parse_key_values(content);

    Ok(ProcIo {
        rchar: required_u64(&fields, FILE, "rchar")?,
        wchar: required_u64(&fields, FILE, "wchar")?,
        syscr: required_u64(&fields, FILE, "syscr")?,
        syscw: required_u64(&fields, FILE, "syscw")?,
        read_bytes: required_u64(&fields, FILE, "read_bytes")?,
        write_bytes: required_u64(&fields, FILE, "write_bytes")?,
    })
}

/// The positional fields of `/proc/[pid]/stat` that the sampler keeps.
///
/// CPU times are raw clock ticks; the sampler converts them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStat {
    pub minor_faults: u64,
    pub major_faults: u64,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub num_threads: u32,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The comm field can contain spaces and parentheses, so fields are counted
/// from the last `)`: the first token after it is field 3 (state).
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    const FILE: &str = "stat";
    let content = content.trim();

    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::MalformedStat("missing ')' after comm".to_string()))?;
    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();

    if fields.len() < STAT_NUM_THREADS - STAT_STATE + 1 {
        return Err(ParseError::MalformedStat(format!(
            "expected at least {} fields, got {}",
            STAT_NUM_THREADS,
            fields.len() + STAT_STATE - 1
        )));
    }

    let field = |position: usize, name: &'static str| -> Result<u64, ParseError> {
        let raw = fields[position - STAT_STATE];
        raw.parse().map_err(|_| ParseError::InvalidValue {
            file: FILE,
            field: name,
            value: raw.to_string(),
        })
    };

    let num_threads = field(STAT_NUM_THREADS, "num_threads")?;

    Ok(ProcStat {
        minor_faults: field(STAT_MINFLT, "minflt")?,
        major_faults: field(STAT_MAJFLT, "majflt")?,
        utime_ticks: field(STAT_UTIME, "utime")?,
        stime_ticks: field(STAT_STIME, "stime")?,
        num_threads: u32::try_from(num_threads).map_err(|_| ParseError::InvalidValue {
            file: FILE,
            field: "num_threads",
            value: num_threads.to_string(),
        })?,
    })
}
