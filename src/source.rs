//! Reference sources.

use crate::error::SourceError;
use crate::model::Reference;
use std::collections::VecDeque;
use std::io::BufRead;

/// A pull-based stream of references.
pub trait ReferenceSource {
    /// Advance to the next record. Returns the number of attribute values
    /// read, or 0 at end of input.
    fn next_reference(&mut self) -> Result<usize, SourceError>;

    /// Record loaded by the last successful `next_reference`.
    fn current_record(&self) -> Option<&Reference>;

    /// Name used in log lines.
    fn name(&self) -> &str {
        "source"
    }
}

/// Values read for a record, never 0 for a present record.
fn value_count(reference: &Reference) -> usize {
    reference.values.len().max(1)
}

/// In-memory source.
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    pending: VecDeque<Reference>,
    current: Option<Reference>,
}

impl VecSource {
    pub fn new(references: impl IntoIterator<Item = Reference>) -> Self {
        Self {
            pending: references.into_iter().collect(),
            current: None,
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl ReferenceSource for VecSource {
    fn next_reference(&mut self) -> Result<usize, SourceError> {
        self.current = self.pending.pop_front();
        Ok(self.current.as_ref().map(value_count).unwrap_or(0))
    }

    fn current_record(&self) -> Option<&Reference> {
        self.current.as_ref()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// One JSON object per line. Blank lines are skipped.
pub struct JsonLinesSource<R: BufRead> {
    reader: R,
    name: String,
    line: String,
    position: usize,
    current: Option<Reference>,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            line: String::new(),
            position: 0,
            current: None,
        }
    }

    /// Line number of the last record read.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl<R: BufRead> ReferenceSource for JsonLinesSource<R> {
    fn next_reference(&mut self) -> Result<usize, SourceError> {
        self.current = None;
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(0);
            }
            self.position += 1;
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let reference: Reference =
                serde_json::from_str(trimmed).map_err(|err| SourceError::Malformed {
                    position: self.position,
                    reason: err.to_string(),
                })?;
            let count = value_count(&reference);
            self.current = Some(reference);
            return Ok(count);
        }
    }

    fn current_record(&self) -> Option<&Reference> {
        self.current.as_ref()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
