/*!
Persistence primitives for serializing/deserializing checkpoint records
(used by the SQLite checkpoint store and any future persistent backends).

Design Goals:
- Provide explicit serde-friendly structs decoupled from internal
  in-memory representations.
- Keep conversion logic localized (From / TryFrom impls) so the store
  code is lean and declarative.

This module intentionally does NOT perform I/O. It is pure data
transformation and (de)serialization glue.
*/

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Checkpoint, CheckpointPhase};

/// Full persisted shape of one checkpoint record row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCheckpoint {
    pub job_uuid: Uuid,
    pub proc_uuid: Uuid,
    /// Lockable objects as a sorted vector (BTreeSet order preserved).
    pub lockable_objects: Vec<String>,
    pub action_fqn: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: FxHashMap<String, Value>,
    /// Lifecycle phase encoded as a string, see [`encode_phase`].
    pub phase: String,
    pub recoverable: bool,
}

/// Encode a phase into its persisted string form.
#[must_use]
pub fn encode_phase(phase: CheckpointPhase) -> &'static str {
    match phase {
        CheckpointPhase::Registered => "registered",
        CheckpointPhase::Begun => "begun",
        CheckpointPhase::Finished => "finished",
    }
}

/// Decode a persisted phase string. Unknown strings decode conservatively as
/// `Registered` so recovery replays rather than skips the record.
#[must_use]
pub fn decode_phase(s: &str) -> CheckpointPhase {
    match s {
        "begun" => CheckpointPhase::Begun,
        "finished" => CheckpointPhase::Finished,
        _ => CheckpointPhase::Registered,
    }
}

impl PersistedCheckpoint {
    #[must_use]
    pub fn from_checkpoint(
        checkpoint: &Checkpoint,
        phase: CheckpointPhase,
        recoverable: bool,
    ) -> Self {
        Self {
            job_uuid: checkpoint.job_uuid,
            proc_uuid: checkpoint.proc_uuid,
            lockable_objects: checkpoint.lockable_objects.iter().cloned().collect(),
            action_fqn: checkpoint.action_fqn.clone(),
            args: checkpoint.args.clone(),
            kwargs: checkpoint.kwargs.clone(),
            phase: encode_phase(phase).to_string(),
            recoverable,
        }
    }
}

impl From<PersistedCheckpoint> for Checkpoint {
    fn from(persisted: PersistedCheckpoint) -> Self {
        Checkpoint {
            proc_uuid: persisted.proc_uuid,
            lockable_objects: persisted
                .lockable_objects
                .into_iter()
                .collect::<BTreeSet<String>>(),
            job_uuid: persisted.job_uuid,
            action_fqn: persisted.action_fqn,
            args: persisted.args,
            kwargs: persisted.kwargs,
        }
    }
}
