//! Load contexts and the partition policy.
//!
//! Every operation takes an `Option<LoadContext>`. `None` means "unspecified";
//! what that selects depends on the kind of operation:
//!
//! | operation | `Some(Normal)` | `Some(Private)`          | `None`        |
//! |-----------|----------------|--------------------------|---------------|
//! | write     | normal         | private                  | normal        |
//! | remove    | normal         | private                  | both          |
//! | read      | normal         | private, then normal     | normal        |
//!
//! Private data never leaks into normal browsing, but normal values remain
//! visible to private reads until a private value overrides them.
use serde::{Deserialize, Serialize};

use super::types::{Partition, PartitionSet};

/// The browsing context a caller acts on behalf of.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadContext {
    Normal,
    Private,
}

impl LoadContext {
    pub fn is_private(self) -> bool {
        self == LoadContext::Private
    }
}

impl From<bool> for LoadContext {
    /// `true` means private browsing.
    fn from(private: bool) -> Self {
        if private {
            LoadContext::Private
        } else {
            LoadContext::Normal
        }
    }
}

const NORMAL_ONLY: &[Partition] = &[Partition::Normal];
const PRIVATE_THEN_NORMAL: &[Partition] = &[Partition::Private, Partition::Normal];

/// Partition a write lands in.
pub fn write_partition(ctx: Option<LoadContext>) -> Partition {
    match ctx {
        Some(LoadContext::Private) => Partition::Private,
        Some(LoadContext::Normal) | None => Partition::Normal,
    }
}

/// Partitions a removal applies to.
pub fn remove_partitions(ctx: Option<LoadContext>) -> PartitionSet {
    match ctx {
        Some(LoadContext::Normal) => PartitionSet::NORMAL,
        Some(LoadContext::Private) => PartitionSet::PRIVATE,
        None => PartitionSet::all(),
    }
}

/// Partitions a read consults, in priority order.
pub fn read_partitions(ctx: Option<LoadContext>) -> &'static [Partition] {
    match ctx {
        Some(LoadContext::Private) => PRIVATE_THEN_NORMAL,
        Some(LoadContext::Normal) | None => NORMAL_ONLY,
    }
}

/// All partitions a read may consult, as a set.
pub fn read_set(ctx: Option<LoadContext>) -> PartitionSet {
    read_partitions(ctx)
        .iter()
        .fold(PartitionSet::empty(), |set, p| set | p.as_set())
}
