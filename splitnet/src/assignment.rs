//! Task → copy routing table, one map per region.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SplitError};

/// For each region, which copy every task is routed through.
///
/// Invariant: each region's map is total over `0..num_tasks` and its values
/// are dense in `0..num_copies(region)`, with every copy serving at least one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    num_tasks: usize,
    /// `maps[region][task] = copy`
    maps: Vec<Vec<usize>>,
    num_copies: Vec<usize>,
}

impl TaskAssignment {
    /// Fully shared: every task on copy 0 of every region.
    pub fn shared(num_regions: usize, num_tasks: usize) -> Self {
        TaskAssignment {
            num_tasks,
            maps: vec![vec![0; num_tasks]; num_regions],
            num_copies: vec![1; num_regions],
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    pub fn num_regions(&self) -> usize {
        self.maps.len()
    }

    pub fn num_copies(&self, region: usize) -> Result<usize> {
        self.check_region(region)?;
        Ok(self.num_copies[region])
    }

    pub fn copy_of(&self, region: usize, task: usize) -> Result<usize> {
        self.check_region(region)?;
        self.check_task(task)?;
        Ok(self.maps[region][task])
    }

    /// The `task → copy` map of one region.
    pub fn region_map(&self, region: usize) -> Result<&[usize]> {
        self.check_region(region)?;
        Ok(&self.maps[region])
    }

    /// Tasks routed through `copy` at `region`, ascending.
    pub fn tasks_on(&self, region: usize, copy: usize) -> Result<Vec<usize>> {
        self.check_copy(region, copy)?;
        Ok(self.maps[region]
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == copy)
            .map(|(t, _)| t)
            .collect())
    }

    /// `groups[copy]` = tasks on that copy, for every copy of `region`.
    pub fn copy_groups(&self, region: usize) -> Result<Vec<Vec<usize>>> {
        self.check_region(region)?;
        let mut groups = vec![Vec::new(); self.num_copies[region]];
        for (task, &copy) in self.maps[region].iter().enumerate() {
            groups[copy].push(task);
        }
        Ok(groups)
    }

    pub fn check_task(&self, task: usize) -> Result<()> {
        if task >= self.num_tasks {
            return Err(SplitError::TaskOutOfRange {
                task,
                num_tasks: self.num_tasks,
            });
        }
        Ok(())
    }

    fn check_region(&self, region: usize) -> Result<()> {
        if region >= self.maps.len() {
            return Err(SplitError::UnknownRegion {
                region,
                num_regions: self.maps.len(),
            });
        }
        Ok(())
    }

    fn check_copy(&self, region: usize, copy: usize) -> Result<()> {
        self.check_region(region)?;
        if copy >= self.num_copies[region] {
            return Err(SplitError::UnknownCopy {
                region,
                copy,
                num_copies: self.num_copies[region],
            });
        }
        Ok(())
    }

    /// Checks that `group1`/`group2` partition the tasks on `(region, copy)`.
    /// Mutates nothing.
    pub fn validate_split(
        &self,
        region: usize,
        copy: usize,
        group1: &[usize],
        group2: &[usize],
    ) -> Result<()> {
        self.check_copy(region, copy)?;
        if group1.is_empty() || group2.is_empty() {
            return Err(SplitError::EmptyGroup);
        }

        let mut seen = vec![false; self.num_tasks];
        for &task in group1.iter().chain(group2) {
            self.check_task(task)?;
            if seen[task] {
                return Err(SplitError::OverlappingGroups { task });
            }
            seen[task] = true;
            if self.maps[region][task] != copy {
                return Err(SplitError::TaskNotOnCopy { task, region, copy });
            }
        }

        let expected = self.maps[region].iter().filter(|&&c| c == copy).count();
        let covered = group1.len() + group2.len();
        if covered != expected {
            return Err(SplitError::IncompletePartition {
                region,
                copy,
                covered,
                expected,
            });
        }
        Ok(())
    }

    /// Opens a new copy at `region` and moves `moved` onto it. Arguments must
    /// already have passed `validate_split`.
    pub(crate) fn apply_split(&mut self, region: usize, moved: &[usize]) -> usize {
        let new_copy = self.num_copies[region];
        self.num_copies[region] += 1;
        for &task in moved {
            self.maps[region][task] = new_copy;
        }
        new_copy
    }

    /// Whether every region's map is a total function onto a dense, non-empty
    /// set of copies.
    pub fn is_partition(&self) -> bool {
        self.maps.iter().zip(&self.num_copies).all(|(map, &k)| {
            if map.len() != self.num_tasks {
                return false;
            }
            let mut used = vec![false; k];
            for &c in map {
                match used.get_mut(c) {
                    Some(slot) => *slot = true,
                    None => return false,
                }
            }
            used.into_iter().all(|u| u)
        })
    }
}
