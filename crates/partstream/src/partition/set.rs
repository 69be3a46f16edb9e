use crate::{Error, PartId, Result};
use core::fmt;

/// The partitions addressed by one job.
///
/// `full_part_count` is fixed at construction (the target's declared count,
/// at least 1). `used` is either every partition or a caller-specified
/// subset. Iteration is ascending by partition id, so repeated traversals
/// (several `run()` calls, the global cancel) visit partitions in the same
/// order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionSet {
    full_part_count: u32,
    used: Vec<PartId>,
    mask: Vec<bool>,
}

impl PartitionSet {
    /// Builds the set from the target's declared partition count and the
    /// descriptor's partition subset.
    ///
    /// An empty `part_ids` selects every partition. Duplicate ids are
    /// collapsed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPartition`] if `part_ids` names a partition at
    /// or beyond the full partition count.
    pub fn new(declared_part_count: u32, part_ids: &[PartId]) -> Result<Self> {
        let full_part_count = declared_part_count.max(1);
        let mut mask = vec![part_ids.is_empty(); full_part_count as usize];

        for &part_id in part_ids {
            match mask.get_mut(part_id as usize) {
                Some(slot) => *slot = true,
                None => {
                    return Err(Error::InvalidPartition {
                        part_id,
                        part_count: full_part_count,
                    });
                }
            }
        }

        let used = (0..full_part_count)
            .filter(|&part_id| mask[part_id as usize])
            .collect();

        Ok(Self {
            full_part_count,
            used,
            mask,
        })
    }

    pub const fn full_part_count(&self) -> u32 {
        self.full_part_count
    }

    pub fn is_used(&self, part_id: PartId) -> bool {
        self.mask.get(part_id as usize).copied().unwrap_or(false)
    }

    /// Number of partitions in the used set.
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Iterates the used partitions in ascending order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = PartId> + '_ {
        self.used.iter().copied()
    }
}

impl<'a> IntoIterator for &'a PartitionSet {
    type Item = PartId;
    type IntoIter = core::iter::Copied<core::slice::Iter<'a, PartId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.used.iter().copied()
    }
}

impl fmt::Display for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part_count: {}, used: {:?}", self.full_part_count, self.used)
    }
}
