//! Event input: a JSONL stream of rebalance events (file or stdin), plus
//! single-document loaders for the operator tools.
//!
//! Each non-blank line is one event. Lines that do not decode or validate are
//! returned as rejections so the caller can log and skip them; they never reach
//! the pipeline.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use folio::{Allocation, RebalanceEvent, ValidationError};

use crate::error::{Error, Result};

/// One input line: its 1-based number and the decoded event or the reason it
/// was rejected.
#[derive(Debug)]
pub struct SourceLine {
    pub line: usize,
    pub event: std::result::Result<RebalanceEvent, ValidationError>,
}

/// Iterator over the events of a line-oriented reader.
pub struct EventReader<R> {
    name: String,
    lines: io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> EventReader<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            lines: reader.lines(),
            line_no: 0,
        }
    }

    /// Display name of the input (file path or `stdin`).
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<R: BufRead> Iterator for EventReader<R> {
    type Item = Result<SourceLine>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    return Some(Err(Error::InputRead {
                        name: self.name.clone(),
                        source,
                    }));
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(Ok(SourceLine {
                line: self.line_no,
                event: RebalanceEvent::from_json(&line),
            }));
        }
    }
}

/// Boxed reader so file and stdin inputs share one type.
pub type InputReader = EventReader<Box<dyn BufRead + Send>>;

/// Open `path` as an event stream, or stdin when `None` or `-`.
pub fn open_input(path: Option<&Path>) -> Result<InputReader> {
    match path {
        Some(p) if p != Path::new("-") => {
            let file = File::open(p).map_err(|source| Error::InputRead {
                name: p.display().to_string(),
                source,
            })?;
            let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(file));
            Ok(EventReader::new(p.display().to_string(), reader))
        }
        _ => {
            let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(io::stdin()));
            Ok(EventReader::new("stdin", reader))
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::InputRead {
        name: path.display().to_string(),
        source,
    })
}

/// Load and validate a single event document.
pub fn load_event(path: &Path) -> Result<RebalanceEvent> {
    Ok(RebalanceEvent::from_json(&read_file(path)?)?)
}

/// Load and validate a bare allocation map (`{"asset": weight, ...}`).
pub fn load_allocation(path: &Path) -> Result<Allocation> {
    let allocation: Allocation = serde_json::from_str(&read_file(path)?)?;
    allocation.validate_weights()?;
    Ok(allocation)
}
