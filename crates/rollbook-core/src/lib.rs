// ABOUTME: Core library for rollbook, containing the student record model and its change semantics.
// ABOUTME: Defines entities, the lenient codec, the structural diff engine, changelog entries, and exporters.

pub mod codec;
pub mod diff;
pub mod export;
pub mod history;
pub mod model;

pub use codec::{CodecError, Decoded, SkipReport};
pub use diff::{DiffEntry, Field, Member};
pub use history::{ChangeLogEntry, Operation};
pub use model::{BehaviorNote, Entity, Grade, Insight, ValidationError};
