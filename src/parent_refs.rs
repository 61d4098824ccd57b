//! Per-sequence summary of referenced parent sequences.
//!
//! For every parent a sequence references, we keep a step function from
//! "local index reached" to "highest index of that parent known at that
//! point". Ancestry checks ask for the value in force at a local index,
//! which is a floor lookup over the steps.
//!
//! Steps are only appended when the referenced value grows, so a parent
//! that is referenced once at creation time costs a single step.
//!
//! Complexity:
//! - floor lookup: O(log s) per parent, s = number of steps
//! - highest_referenced_markers: O(p log s), p = number of parents
//!
//! Layout:
//! ```text
//! u32 parent count
//! per parent:
//!   SequenceID (8)
//!   u32 step count
//!   step count x (Index local (8), Index highest (8))
//! ```

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::codec::Decode;
use crate::codec::Encode;
use crate::codec::Reader;
use crate::codec::Writer;
use crate::codec::bounded_capacity;
use crate::error::DecodeContext;
use crate::error::DecodeError;
use crate::error::Error;
use crate::id::INDEX_LENGTH;
use crate::id::Index;
use crate::id::SequenceId;
use crate::id::SequenceIds;
use crate::markers::UniqueMarkers;

/// One entry of a step function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Step {
    /// Local index of the owning sequence at which this value takes effect.
    pub local: Index,
    /// Highest index of the parent known from `local` onwards.
    pub highest: Index,
}

/// A monotone step function over local indexes.
///
/// Invariant: `local` strictly increases and `highest` never decreases
/// from one step to the next, and there is at least one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepFunction {
    steps: SmallVec<[Step; 2]>,
}

impl StepFunction {
    fn anchored(local: Index, highest: Index) -> StepFunction {
        let mut steps = SmallVec::new();
        steps.push(Step { local, highest });
        return StepFunction { steps };
    }

    /// Build from explicit `(local, highest)` pairs, enforcing monotonicity.
    pub fn from_steps<I: IntoIterator<Item = (Index, Index)>>(steps: I) -> Result<StepFunction, DecodeError> {
        let mut function = StepFunction { steps: SmallVec::new() };
        for (local, highest) in steps {
            function.push_checked(Step { local, highest })?;
        }
        if function.steps.is_empty() {
            return Err(DecodeError::Invalid("step function has no steps".to_string()));
        }
        return Ok(function);
    }

    fn push_checked(&mut self, step: Step) -> Result<(), DecodeError> {
        if let Some(last) = self.steps.last() {
            if step.local <= last.local {
                return Err(DecodeError::Invalid(format!(
                    "step local index {} does not follow {}",
                    step.local, last.local
                )));
            }
            if step.highest < last.highest {
                return Err(DecodeError::Invalid(format!(
                    "step highest index {} at local {} regresses below {}",
                    step.highest, step.local, last.highest
                )));
            }
        }
        self.steps.push(step);
        return Ok(());
    }

    /// The value in force at `local`: the last step at or before it.
    pub fn floor(&self, local: Index) -> Option<Index> {
        let position = self.steps.partition_point(|step| step.local <= local);
        if position == 0 {
            return None;
        }
        return Some(self.steps[position - 1].highest);
    }

    pub fn steps(&self) -> &[Step] {
        return &self.steps;
    }

    fn last(&self) -> Step {
        // Non-empty by construction.
        return self.steps[self.steps.len() - 1];
    }
}

impl Encode for StepFunction {
    fn encode(&self, writer: &mut Writer) {
        writer.write_count(self.steps.len());
        for step in &self.steps {
            writer.write(&step.local).write(&step.highest);
        }
    }
}

impl Decode for StepFunction {
    fn decode(reader: &mut Reader<'_>) -> Result<StepFunction, DecodeError> {
        let count = reader.read_u32().field("step count")?;
        if count == 0 {
            return Err(DecodeError::Invalid("step function has no steps".to_string()));
        }
        let mut function = StepFunction {
            steps: SmallVec::with_capacity(bounded_capacity(count, reader, 2 * INDEX_LENGTH)),
        };
        for _ in 0..count {
            let local = Index::decode(reader).field("step local index")?;
            let highest = Index::decode(reader).field("step highest index")?;
            function.push_checked(Step { local, highest })?;
        }
        return Ok(function);
    }
}

/// Highest referenced parent indexes, as they evolved with the owning sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParentReferences {
    references: BTreeMap<SequenceId, StepFunction>,
}

impl ParentReferences {
    /// Anchor one step function per referenced parent at local index 0.
    pub fn new(referenced: &UniqueMarkers) -> ParentReferences {
        let references = referenced
            .iter()
            .map(|(sequence_id, highest)| (*sequence_id, StepFunction::anchored(Index::ZERO, *highest)))
            .collect();
        return ParentReferences { references };
    }

    /// Build from explicit step functions per parent.
    pub fn from_step_functions<I>(functions: I) -> Result<ParentReferences, DecodeError>
    where
        I: IntoIterator<Item = (SequenceId, StepFunction)>,
    {
        let mut references = BTreeMap::new();
        for (sequence_id, function) in functions {
            if references.insert(sequence_id, function).is_some() {
                return Err(DecodeError::Invalid(format!("{sequence_id} referenced twice")));
            }
        }
        return Ok(ParentReferences { references });
    }

    /// The set of parents referenced.
    pub fn sequence_ids(&self) -> SequenceIds {
        return SequenceIds::new(self.references.keys().copied());
    }

    /// The highest index of `parent` known as of `local`.
    pub fn highest_referenced_index(&self, parent: &SequenceId, local: Index) -> Option<Index> {
        return self.references.get(parent).and_then(|function| function.floor(local));
    }

    /// The highest index of every parent known as of `local`. Parents with
    /// no step at or before `local` are omitted.
    pub fn highest_referenced_markers(&self, local: Index) -> UniqueMarkers {
        let mut markers = UniqueMarkers::new();
        for (sequence_id, function) in &self.references {
            if let Some(highest) = function.floor(local) {
                markers.insert(*sequence_id, highest);
            }
        }
        return markers;
    }

    /// Record that from `local` onwards the owning sequence references the
    /// given parent indexes.
    ///
    /// Only already-referenced parents may be refined; the parent set is
    /// part of the sequence's identity. A step is appended only when the
    /// value grows. Lower values than already recorded are rejected.
    ///
    /// This is the allocator's builder path for references that are still
    /// being assembled. A persisted `Sequence` never changes its references;
    /// its storage rejects any transition that touches them.
    pub fn add_references(&mut self, local: Index, referenced: &UniqueMarkers) -> Result<bool, Error> {
        for (sequence_id, highest) in referenced.iter() {
            let Some(function) = self.references.get(sequence_id) else {
                return Err(Error::InvalidConstruction(format!(
                    "{sequence_id} is not a parent of this sequence"
                )));
            };
            let last = function.last();
            if *highest < last.highest {
                return Err(Error::InvalidConstruction(format!(
                    "reference to {sequence_id} regresses from {} to {highest}",
                    last.highest
                )));
            }
            if *highest > last.highest && local < last.local {
                return Err(Error::InvalidConstruction(format!(
                    "reference to {sequence_id} at local {local} precedes last step at {}",
                    last.local
                )));
            }
        }

        let mut changed = false;
        for (sequence_id, highest) in referenced.iter() {
            let Some(function) = self.references.get_mut(sequence_id) else {
                continue;
            };
            let last = function.last();
            if *highest == last.highest {
                continue;
            }
            if local == last.local {
                let position = function.steps.len() - 1;
                function.steps[position].highest = *highest;
            } else {
                function.steps.push(Step { local, highest: *highest });
            }
            changed = true;
        }
        return Ok(changed);
    }

    /// The step function recorded for `parent`.
    pub fn step_function(&self, parent: &SequenceId) -> Option<&StepFunction> {
        return self.references.get(parent);
    }

    /// Number of parents referenced.
    pub fn len(&self) -> usize {
        return self.references.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.references.is_empty();
    }
}

impl Encode for ParentReferences {
    fn encode(&self, writer: &mut Writer) {
        writer.write_count(self.references.len());
        for (sequence_id, function) in &self.references {
            writer.write(sequence_id).write(function);
        }
    }
}

impl Decode for ParentReferences {
    /// Parents must appear in strictly ascending order, matching the encoder.
    fn decode(reader: &mut Reader<'_>) -> Result<ParentReferences, DecodeError> {
        let count = reader.read_u32().field("parent count")?;
        let mut references = BTreeMap::new();
        let mut previous: Option<SequenceId> = None;
        for _ in 0..count {
            let sequence_id = SequenceId::decode(reader).field("parent SequenceID")?;
            if let Some(previous) = previous {
                if previous >= sequence_id {
                    return Err(DecodeError::Invalid(format!(
                        "parent {sequence_id} out of order after {previous}"
                    )));
                }
            }
            let function = StepFunction::decode(reader).field("parent step function")?;
            references.insert(sequence_id, function);
            previous = Some(sequence_id);
        }
        return Ok(ParentReferences { references });
    }
}
