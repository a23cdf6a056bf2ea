//! A finished usage timeline in a form that can be written out and drawn
//! somewhere else.

use std::{io, time::Duration};

use serde::{Deserialize, Serialize};

use super::UsageEvent;
use crate::{error::MemError, serialize::serde_nanos};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    #[serde(with = "serde_nanos")]
    pub granularity: Duration,
    pub peak: i64,
    /// Ordered by first sample time, then by last sample time.
    pub events: Vec<UsageEvent>,
}

impl UsageReport {
    pub fn write_json<W: io::Write>(&self, writer: W) -> Result<(), MemError> {
        serde_json::to_writer_pretty(writer, self).map_err(|e| MemError::Io {
            context: "writing usage report".into(),
            source: e.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, MemError> {
        let mut out = Vec::new();
        self.write_json(&mut out)?;
        String::from_utf8(out).map_err(|e| MemError::Io {
            context: "writing usage report".into(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }

    /// Deepest nesting level among the events.
    pub fn max_depth(&self) -> usize {
        self.events.iter().map(|e| e.depth).max().unwrap_or(0)
    }
}
