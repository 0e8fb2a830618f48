//! Best-fit-decreasing placement of files onto accounts.

use skyshard_accounts::AccountCapacity;
use skyshard_common::{AccountId, Error, FileDescriptor, Result};

/// One file assigned to one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Position of the file in the planner input.
    pub index: usize,
    pub account_id: AccountId,
}

/// Outcome of [`plan`]. Advisory: free space may change before execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Assignments in placement order (largest file first).
    pub placements: Vec<Placement>,
    /// Input positions of files no account can hold.
    pub unplaced: Vec<usize>,
}

impl Plan {
    /// `CapacityExceeded` naming every unplaced file, if any.
    pub fn check(&self, files: &[FileDescriptor]) -> Result<()> {
        if self.unplaced.is_empty() {
            return Ok(());
        }
        Err(Error::CapacityExceeded {
            unplaced: self
                .unplaced
                .iter()
                .map(|&i| files[i].name.clone())
                .collect(),
        })
    }

    /// The account chosen for input position `index`.
    pub fn account_for(&self, index: usize) -> Option<&AccountId> {
        self.placements
            .iter()
            .find(|p| p.index == index)
            .map(|p| &p.account_id)
    }
}

/// Assign `files` to accounts.
///
/// Files are taken largest first, equal sizes in input order. Each goes to
/// the account with the most free space left, provided the file fits; equal
/// free space goes to the older account. A file is never split and never
/// assigned to an account with less free space than its size.
pub fn plan(files: &[FileDescriptor], capacities: &[AccountCapacity]) -> Plan {
    let mut accounts: Vec<(&AccountCapacity, u64)> =
        capacities.iter().map(|c| (c, c.free_bytes)).collect();
    accounts.sort_by(|(a, _), (b, _)| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.account_id.cmp(&b.account_id))
    });

    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by(|&a, &b| files[b].size_bytes.cmp(&files[a].size_bytes));

    let mut plan = Plan::default();
    for index in order {
        let size = files[index].size_bytes;
        let mut best: Option<usize> = None;
        for (slot, (_, free)) in accounts.iter().enumerate() {
            if *free < size {
                continue;
            }
            if best.map_or(true, |b| *free > accounts[b].1) {
                best = Some(slot);
            }
        }
        match best {
            Some(slot) => {
                let (capacity, free) = &mut accounts[slot];
                *free -= size;
                plan.placements.push(Placement {
                    index,
                    account_id: capacity.account_id.clone(),
                });
            }
            None => plan.unplaced.push(index),
        }
    }
    plan
}
