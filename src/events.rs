//! # Cluster Events
//!
//! Notifications emitted as references are linked. Sinks decide what to do
//! with them: collect, fold into a merge map, or stream as JSON lines.

use crate::model::{ClusterId, RefId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    ClusterCreated {
        id: ClusterId,
        reference: RefId,
    },
    ClusterMerged {
        absorbed: ClusterId,
        survivor: ClusterId,
    },
    ClusterUpdated {
        id: ClusterId,
        /// Set when the update replaced the published id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_id: Option<ClusterId>,
        reference: RefId,
    },
    /// Content id recomputed after a merge that had no incoming reference
    ClusterRenamed {
        id: ClusterId,
        previous_id: ClusterId,
    },
    /// Identities a reference matched without changing the repository
    ReferenceResolved {
        reference: RefId,
        ids: Vec<ClusterId>,
    },
    ClusterSplit {
        from: ClusterId,
        created: ClusterId,
        reference: RefId,
    },
}

pub trait EventSink {
    fn emit(&mut self, event: &ClusterEvent) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl EventSink for Vec<ClusterEvent> {
    fn emit(&mut self, event: &ClusterEvent) -> Result<()> {
        self.push(event.clone());
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &ClusterEvent) -> Result<()> {
        Ok(())
    }
}

/// Folds merges and id replacements into a map from retired id to the id
/// currently standing for it.
#[derive(Debug, Clone, Default)]
pub struct MergeMap {
    replaced: BTreeMap<ClusterId, ClusterId>,
}

impl MergeMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn retire(&mut self, old: &ClusterId, new: &ClusterId) {
        if old == new {
            return;
        }
        for target in self.replaced.values_mut() {
            if target == old {
                *target = new.clone();
            }
        }
        self.replaced.insert(old.clone(), new.clone());
    }

    /// Current id for a possibly retired id.
    pub fn current<'a>(&'a self, id: &'a ClusterId) -> &'a ClusterId {
        self.replaced.get(id).unwrap_or(id)
    }

    pub fn entries(&self) -> &BTreeMap<ClusterId, ClusterId> {
        &self.replaced
    }

    pub fn len(&self) -> usize {
        self.replaced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replaced.is_empty()
    }
}

impl EventSink for MergeMap {
    fn emit(&mut self, event: &ClusterEvent) -> Result<()> {
        match event {
            ClusterEvent::ClusterMerged { absorbed, survivor } => self.retire(absorbed, survivor),
            ClusterEvent::ClusterUpdated {
                id,
                previous_id: Some(previous),
                ..
            } => self.retire(previous, id),
            ClusterEvent::ClusterRenamed { id, previous_id } => self.retire(previous_id, id),
            _ => {}
        }
        Ok(())
    }
}

/// Writes one JSON object per event.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: &ClusterEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
