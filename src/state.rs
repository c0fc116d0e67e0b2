//! Persisted in-flight state for shell mode.
//!
//! A "start timer" process saves the label, start time and per-thread
//! counter snapshots of its sections, then exits; a later "stop timer"
//! process loads the file and completes the brackets. Only raw snapshots
//! cross the boundary — derived vectors are recomputed after load so the
//! two-process path behaves exactly like the in-process one.
//!
//! # File format
//!
//! One header line with the HWPC chooser, then per section: a label
//! line, a line `start_time thread_count event_count`, and
//! `thread_count x event_count` integer snapshots, one per line.
//! `start_time` is written in shortest round-trip decimal form.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::{self, FromStr};

use nom::*;

use crate::config::HwpcChooser;
use crate::error::StateError;

/// One persisted section.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSection {
    pub label: String,
    /// Start time in the saving process's clock. Only meaningful to a
    /// loader on the same node within the same boot.
    pub start_time: f64,
    pub threads: usize,
    pub events: usize,
    /// `threads * events` snapshots, thread-major.
    pub snapshots: Vec<u64>,
}

impl SavedSection {
    /// The snapshot row of one thread.
    pub fn thread_row(&self, t: usize) -> &[u64] {
        &self.snapshots[t * self.events..(t + 1) * self.events]
    }
}

/// A whole persisted state file.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedState {
    pub chooser: HwpcChooser,
    pub sections: Vec<SavedSection>,
}

fn is_space_byte(c: u8) -> bool {
    c == b' '
}

fn is_token_byte(c: u8) -> bool {
    c != b' ' && c != b'\n'
}

fn is_line_byte(c: u8) -> bool {
    c != b'\n'
}

named!(text_line<&[u8], &str>,
    map_res!(terminated!(take_while!(is_line_byte), tag!("\n")), str::from_utf8)
);

named!(token<&[u8], &str>,
    map_res!(
        preceded!(take_while!(is_space_byte), take_while1!(is_token_byte)),
        str::from_utf8
    )
);

named!(float_field<&[u8], f64>, map_res!(token, f64::from_str));
named!(count_field<&[u8], usize>, map_res!(token, usize::from_str));
named!(snapshot_line<&[u8], u64>,
    terminated!(map_res!(token, u64::from_str), tag!("\n"))
);

named!(header<&[u8], HwpcChooser>,
    do_parse!(
        tag!("pmlib-state 1") >>
        chooser: map_opt!(token, HwpcChooser::parse) >>
        tag!("\n") >>
        (chooser)
    )
);

named!(section<&[u8], SavedSection>,
    do_parse!(
        label: text_line >>
        start_time: float_field >>
        threads: count_field >>
        events: count_field >>
        tag!("\n") >>
        snapshots: count!(snapshot_line, threads * events) >>
        (SavedSection {
            label: label.to_string(),
            start_time,
            threads,
            events,
            snapshots,
        })
    )
);

named!(state_file<&[u8], SavedState>,
    do_parse!(
        chooser: header >>
        sections: many0!(complete!(section)) >>
        (SavedState { chooser, sections })
    )
);

impl SavedState {
    /// Parse a state file image.
    pub fn parse(bytes: &[u8]) -> Result<SavedState, StateError> {
        match state_file(bytes) {
            Ok((rest, state)) => {
                if rest.is_empty() {
                    Ok(state)
                } else {
                    Err(StateError::TrailingBytes)
                }
            }
            Err(_) => Err(StateError::Format),
        }
    }

    /// Serialise to the line format above.
    pub fn write_to(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "pmlib-state 1 {}", self.chooser.name())?;
        for s in &self.sections {
            writeln!(w, "{}", s.label)?;
            writeln!(w, "{} {} {}", s.start_time, s.threads, s.events)?;
            for v in &s.snapshots {
                writeln!(w, "{}", v)?;
            }
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<SavedState, StateError> {
        let bytes = fs::read(path)?;
        SavedState::parse(&bytes)
    }
}

/// The state path for this shell invocation: job name, job ID and the
/// parent process ID under a private directory in the user's home.
pub fn default_state_path() -> Result<PathBuf, StateError> {
    let home = dirs::home_dir().ok_or(StateError::NoHome)?;
    let dir = home.join(".pmlib");
    make_private_dir(&dir)?;
    let job = env::var("PJM_JOBNAME").unwrap_or_else(|_| "nojob".to_string());
    let id = env::var("PJM_JOBID").unwrap_or_else(|_| "0".to_string());
    Ok(dir.join(format!("{}.{}.{}.state", job, id, parent_pid())))
}

#[cfg(unix)]
fn make_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn make_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    unsafe { libc::getppid() as u32 }
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SavedState {
        SavedState {
            chooser: HwpcChooser::Flops,
            sections: vec![
                SavedSection {
                    label: "matmul kernel".to_string(),
                    start_time: 12345.678901234567,
                    threads: 2,
                    events: 2,
                    snapshots: vec![1, 2, 30000000000, 4],
                },
                SavedSection {
                    label: "halo".to_string(),
                    start_time: 0.125,
                    threads: 1,
                    events: 2,
                    snapshots: vec![7, 8],
                },
            ],
        }
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let state = sample();
        let mut bytes = Vec::new();
        state.write_to(&mut bytes).unwrap();
        let back = SavedState::parse(&bytes).unwrap();
        assert_eq!(back, state);
        // f64 equality must be exact, not approximate.
        assert_eq!(
            back.sections[0].start_time.to_bits(),
            state.sections[0].start_time.to_bits()
        );
    }

    #[test]
    fn labels_may_contain_spaces() {
        let state = sample();
        let mut bytes = Vec::new();
        state.write_to(&mut bytes).unwrap();
        let back = SavedState::parse(&bytes).unwrap();
        assert_eq!(back.sections[0].label, "matmul kernel");
        assert_eq!(back.sections[0].thread_row(1), &[30000000000, 4]);
    }

    #[test]
    fn header_only_is_an_empty_state() {
        let back = SavedState::parse(b"pmlib-state 1 CACHE\n").unwrap();
        assert_eq!(back.chooser, HwpcChooser::Cache);
        assert!(back.sections.is_empty());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            SavedState::parse(b"not a state file\n"),
            Err(StateError::Format)
        ));
        assert!(matches!(
            SavedState::parse(b"pmlib-state 1 NONSENSE\n"),
            Err(StateError::Format)
        ));
    }

    #[test]
    fn short_section_is_rejected() {
        // Promises 2x2 snapshots but carries three.
        let text = b"pmlib-state 1 FLOPS\nkernel\n1.5 2 2\n1\n2\n3\n";
        assert!(SavedState::parse(text).is_err());
    }
}
