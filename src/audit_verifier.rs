//! Offline verification of audit segments
//!
//! Walks a segment line by line, recomputing each record's chain hash and
//! checking that sequence numbers strictly increase. Used when resuming a
//! segment and by `cynapse audit-verify`.

use crate::audit_log::AuditEntry;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// `prev_hash` of the first record in every segment
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Cannot read audit segment: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: malformed audit record: {message}")]
    Malformed { line: usize, message: String },

    #[error("Line {line}: sequence {found} does not follow {previous}")]
    SequenceRegression {
        line: usize,
        previous: u64,
        found: u64,
    },

    #[error("Line {line}: hash chain broken")]
    BrokenChain { line: usize },
}

/// Summary of an intact segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentReport {
    pub entries: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: u64,
    pub last_hash: Option<String>,
}

/// Verify a whole segment. The first problem found is returned.
pub fn verify_segment(path: &Path) -> Result<SegmentReport, VerifyError> {
    let reader = BufReader::new(File::open(path)?);

    let mut report = SegmentReport {
        entries: 0,
        first_sequence: None,
        last_sequence: 0,
        last_hash: None,
    };
    let mut previous_hash = GENESIS_HASH.to_string();

    for (idx, line) in reader.lines().enumerate() {
        let line_number = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: AuditEntry =
            serde_json::from_str(&line).map_err(|e| VerifyError::Malformed {
                line: line_number,
                message: e.to_string(),
            })?;

        if report.entries > 0 && entry.sequence <= report.last_sequence {
            return Err(VerifyError::SequenceRegression {
                line: line_number,
                previous: report.last_sequence,
                found: entry.sequence,
            });
        }

        let linked: bool = entry
            .prev_hash
            .as_bytes()
            .ct_eq(previous_hash.as_bytes())
            .into();
        let recomputed = entry.compute_hash().map_err(|e| VerifyError::Malformed {
            line: line_number,
            message: e.to_string(),
        })?;
        let sealed: bool = recomputed.as_bytes().ct_eq(entry.hash.as_bytes()).into();
        if !linked || !sealed {
            return Err(VerifyError::BrokenChain { line: line_number });
        }

        report.entries += 1;
        report.first_sequence.get_or_insert(entry.sequence);
        report.last_sequence = entry.sequence;
        previous_hash = entry.hash.clone();
        report.last_hash = Some(entry.hash);
    }

    Ok(report)
}
