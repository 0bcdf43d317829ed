//! Workspace snapshot codec.
//!
//! A snapshot is a `bincode` envelope carrying a magic tag, a format version
//! and a JSON body. The body holds the entity stores and the small amount of
//! engine state that cannot be derived from them (scheduler queue, rollback
//! blocks, stamping clock, last applied offset). Indexes and caches are
//! rebuilt on restore. Unknown body fields written by a newer engine of the
//! same format version are kept and written back.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::scheduler::{ScheduledEntry, Scheduler};
use crate::state::Stores;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use rollout_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

/// Envelope magic
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RWSS";

/// Current body format
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 4],
    format_version: u32,
    body: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Body {
    workspace_id: String,
    stores: Stores,
    #[serde(default)]
    scheduled: Vec<ScheduledEntry>,
    #[serde(default)]
    rollback_blocks: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    last_stamp: Option<DateTime<Utc>>,
    #[serde(default = "no_offset")]
    last_processed_offset: i64,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn no_offset() -> i64 {
    -1
}

/// Encode a workspace
pub fn encode(ws: &Workspace) -> CoreResult<Vec<u8>> {
    let body = Body {
        workspace_id: ws.id().to_string(),
        stores: ws.stores.clone(),
        scheduled: ws.scheduler.entries(),
        rollback_blocks: ws.rollback_blocks.clone(),
        last_stamp: ws.last_stamp,
        last_processed_offset: ws.last_processed_offset,
        extra: ws.snapshot_extra.clone(),
    };
    let envelope = Envelope {
        magic: SNAPSHOT_MAGIC,
        format_version: SNAPSHOT_FORMAT_VERSION,
        body: serde_json::to_vec(&body)?,
    };
    bincode::serialize(&envelope).map_err(|e| CoreError::SnapshotError(format!("Failed to encode snapshot: {}", e)))
}

/// Restore a workspace.
///
/// The restored workspace replays events up to and including the stored
/// offset; every release target is queued for re-planning.
pub fn decode(bytes: &[u8], config: EngineConfig, clock: Arc<dyn Clock>) -> CoreResult<Workspace> {
    let envelope: Envelope = bincode::deserialize(bytes)
        .map_err(|e| CoreError::SnapshotError(format!("Failed to decode snapshot envelope: {}", e)))?;
    if envelope.magic != SNAPSHOT_MAGIC {
        return Err(CoreError::SnapshotError("Not a workspace snapshot".to_string()));
    }
    if envelope.format_version > SNAPSHOT_FORMAT_VERSION {
        return Err(CoreError::SnapshotError(format!(
            "Snapshot format {} is newer than supported format {}",
            envelope.format_version, SNAPSHOT_FORMAT_VERSION
        )));
    }

    let body: Body = serde_json::from_slice(&envelope.body)
        .map_err(|e| CoreError::SnapshotError(format!("Failed to decode snapshot body: {}", e)))?;

    let mut ws = Workspace::new(body.workspace_id, config, clock);
    ws.stores = body.stores;
    ws.scheduler = Scheduler::from_entries(body.scheduled);
    ws.rollback_blocks = body.rollback_blocks;
    ws.last_stamp = body.last_stamp;
    ws.last_processed_offset = body.last_processed_offset;
    ws.snapshot_offset = body.last_processed_offset;
    ws.snapshot_extra = body.extra;
    ws.rebuild_indexes();

    info!(
        workspace_id = %ws.id(),
        offset = ws.snapshot_offset,
        release_targets = ws.release_targets.len(),
        "Restored workspace from snapshot"
    );
    Ok(ws)
}
