//! Load balancing of banks across a fixed number of workers.
//!
//! Banks are measured in chunks of at most `chunk_size` events. A balanced
//! partitioning groups banks so that each group of workers carries a
//! similar number of chunks per worker; workers inside a group then take
//! the group's chunks round-robin.

use crate::{Error, LoadRange, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A group of banks loaded cooperatively by `workers` workers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Partition {
    pub workers: usize,
    pub banks: Vec<usize>,
}

/// Computes per-worker load ranges for a set of banks.
#[derive(Clone, Debug)]
pub struct Chunker {
    worker: usize,
    chunk_size: usize,
    bank_sizes: Vec<usize>,
    chunk_counts: Vec<usize>,
    partitioning: Vec<Partition>,
}

impl Chunker {
    /// Creates a chunker for worker `worker` out of `num_workers`.
    ///
    /// # Errors
    /// Returns an error if `num_workers` or `chunk_size` is 0, or if
    /// `worker` is not below `num_workers`.
    pub fn new(
        num_workers: usize,
        worker: usize,
        bank_sizes: Vec<usize>,
        chunk_size: usize,
    ) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::ConfigError(
                "number of workers must be at least 1".to_string(),
            ));
        }
        if worker >= num_workers {
            return Err(Error::ConfigError(format!(
                "worker {worker} out of range for {num_workers} workers"
            )));
        }
        if chunk_size == 0 {
            return Err(Error::ConfigError(
                "chunk size must be at least 1".to_string(),
            ));
        }

        let chunk_counts: Vec<usize> = bank_sizes
            .iter()
            .map(|&size| size.div_ceil(chunk_size))
            .collect();
        let partitioning = Self::make_balanced_partitioning(num_workers, &chunk_counts);

        Ok(Self {
            worker,
            chunk_size,
            bank_sizes,
            chunk_counts,
            partitioning,
        })
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bank sizes in chunks.
    #[must_use]
    pub fn chunk_counts(&self) -> &[usize] {
        &self.chunk_counts
    }

    #[must_use]
    pub fn partitioning(&self) -> &[Partition] {
        &self.partitioning
    }

    /// Worker ids of each partition, numbered sequentially in partition order.
    #[must_use]
    pub fn make_worker_groups(&self) -> Vec<Vec<usize>> {
        let mut next = 0;
        self.partitioning
            .iter()
            .map(|partition| {
                let group: Vec<usize> = (next..next + partition.workers).collect();
                next += partition.workers;
                group
            })
            .collect()
    }

    /// Load ranges of this worker.
    ///
    /// The result is padded with zero-count ranges up to the largest
    /// per-worker chunk count of any partition, so every worker performs the
    /// same number of load steps.
    #[must_use]
    pub fn make_load_ranges(&self) -> Vec<LoadRange> {
        let mut ranges = Vec::new();
        let mut max_chunks = 0;
        let mut first_worker = 0;

        for partition in &self.partitioning {
            let chunks: usize = partition
                .banks
                .iter()
                .map(|&bank| self.chunk_counts[bank])
                .sum();
            max_chunks = max_chunks.max(chunks.div_ceil(partition.workers));

            let group = first_worker..first_worker + partition.workers;
            if group.contains(&self.worker) {
                let offset = self.worker - first_worker;
                let mut slot = 0usize;
                for &bank in &partition.banks {
                    let size = self.bank_sizes[bank];
                    for chunk in 0..self.chunk_counts[bank] {
                        if slot % partition.workers == offset {
                            let start = chunk * self.chunk_size;
                            let count = self.chunk_size.min(size - start);
                            ranges.push(LoadRange::new(bank, start, count));
                        }
                        slot += 1;
                    }
                }
            }
            first_worker += partition.workers;
        }

        ranges.resize(max_chunks, LoadRange::padding());
        ranges
    }

    /// Greedy largest-first bin packing of `sizes` onto `workers` workers.
    ///
    /// Every index of `sizes` appears in exactly one partition and the
    /// worker counts sum to `workers`. The result depends only on the inputs.
    #[must_use]
    pub fn make_balanced_partitioning(workers: usize, sizes: &[usize]) -> Vec<Partition> {
        let workers = workers.max(1);
        let total: usize = sizes.iter().sum();
        if total == 0 {
            return vec![Partition {
                workers,
                banks: (0..sizes.len()).collect(),
            }];
        }

        let mut order: Vec<usize> = (0..sizes.len()).collect();
        order.sort_by(|&a, &b| sizes[b].cmp(&sizes[a]));

        let share = total.div_ceil(workers);
        let step = (share / 16).max(1);
        let mut padding = 0;
        let mut partitioning = loop {
            let candidate = greedy_partitioning(workers, sizes, &order, share, padding);
            if candidate.len() <= workers {
                break candidate;
            }
            padding += step;
        };

        let loads: Vec<usize> = partitioning
            .iter()
            .map(|partition| partition.banks.iter().map(|&bank| sizes[bank]).sum())
            .collect();
        let mut assigned: usize = partitioning.iter().map(|partition| partition.workers).sum();
        while assigned > workers {
            let Some(chosen) = best_worker_removal(&partitioning, &loads) else {
                break;
            };
            partitioning[chosen].workers -= 1;
            assigned -= 1;
        }
        if assigned < workers {
            partitioning.push(Partition {
                workers: workers - assigned,
                banks: Vec::new(),
            });
        }

        partitioning
    }
}

fn greedy_partitioning(
    workers: usize,
    sizes: &[usize],
    order: &[usize],
    share: usize,
    padding: usize,
) -> Vec<Partition> {
    let total: usize = sizes.iter().sum();
    let mut processed = vec![false; order.len()];
    let mut partitioning = Vec::new();

    for i in 0..order.len() {
        if processed[i] {
            continue;
        }
        processed[i] = true;
        let index = order[i];
        let size = sizes[index];
        let group_workers = (workers * size).div_ceil(total).max(1);
        let mut remaining = (group_workers * share + padding).saturating_sub(size);
        let mut banks = vec![index];

        for j in i + 1..order.len() {
            if processed[j] {
                continue;
            }
            let candidate = sizes[order[j]];
            if candidate <= remaining {
                remaining -= candidate;
                banks.push(order[j]);
                processed[j] = true;
            }
        }

        partitioning.push(Partition {
            workers: group_workers,
            banks,
        });
    }

    partitioning
}

/// Index of the partition whose loss of one worker yields the smallest
/// maximum per-worker load. Only partitions with more than one worker qualify.
#[allow(clippy::cast_precision_loss)]
fn best_worker_removal(partitioning: &[Partition], loads: &[usize]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for candidate in 0..partitioning.len() {
        if partitioning[candidate].workers < 2 {
            continue;
        }
        let max_load = partitioning
            .iter()
            .zip(loads)
            .enumerate()
            .map(|(k, (partition, &load))| {
                let workers = if k == candidate {
                    partition.workers - 1
                } else {
                    partition.workers
                };
                load as f64 / workers as f64
            })
            .fold(0.0, f64::max);
        match best {
            Some((_, current)) if current <= max_load => {}
            _ => best = Some((candidate, max_load)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_cover(partitioning: &[Partition], workers: usize, bank_count: usize) {
        let mut seen = vec![0usize; bank_count];
        for partition in partitioning {
            for &bank in &partition.banks {
                seen[bank] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1), "banks {seen:?}");
        let total: usize = partitioning.iter().map(|p| p.workers).sum();
        assert_eq!(total, workers);
    }

    #[test]
    fn test_single_worker_gets_everything() {
        let partitioning = Chunker::make_balanced_partitioning(1, &[3, 1, 2]);
        assert_eq!(partitioning.len(), 1);
        assert_eq!(partitioning[0].workers, 1);
        assert_eq!(partitioning[0].banks, vec![0, 2, 1]);
    }

    #[test]
    fn test_equal_banks_equal_workers() {
        let partitioning = Chunker::make_balanced_partitioning(4, &[10, 10, 10, 10]);
        assert_cover(&partitioning, 4, 4);
        assert!(partitioning.iter().all(|p| p.banks.len() == 1 && p.workers == 1));
    }

    #[test]
    fn test_large_bank_gets_more_workers() {
        let partitioning = Chunker::make_balanced_partitioning(4, &[30, 5, 5]);
        assert_cover(&partitioning, 4, 3);
        assert_eq!(partitioning[0].banks[0], 0);
        assert!(partitioning[0].workers >= 2);
    }

    #[test]
    fn test_rounding_correction_keeps_worker_total() {
        let sizes = [7, 7, 7];
        let partitioning = Chunker::make_balanced_partitioning(2, &sizes);
        assert_cover(&partitioning, 2, 3);
    }

    #[test]
    fn test_excess_workers_removed_from_least_loaded_side() {
        let partitioning = Chunker::make_balanced_partitioning(3, &[10, 9]);
        assert_eq!(
            partitioning,
            vec![
                Partition {
                    workers: 2,
                    banks: vec![0]
                },
                Partition {
                    workers: 1,
                    banks: vec![1]
                },
            ]
        );
    }

    #[test]
    fn test_leftover_workers_get_padding_partition() {
        let partitioning = Chunker::make_balanced_partitioning(3, &[5, 5, 5, 5]);
        assert_cover(&partitioning, 3, 4);
        let last = partitioning.last().unwrap();
        assert!(last.banks.is_empty());
        assert_eq!(last.workers, 1);
    }

    #[test]
    fn test_all_zero_sizes() {
        let partitioning = Chunker::make_balanced_partitioning(3, &[0, 0]);
        assert_eq!(
            partitioning,
            vec![Partition {
                workers: 3,
                banks: vec![0, 1]
            }]
        );
    }

    #[test]
    fn test_no_banks() {
        let partitioning = Chunker::make_balanced_partitioning(2, &[]);
        assert_cover(&partitioning, 2, 0);
    }

    #[test]
    fn test_zero_bank_joins_existing_group() {
        let partitioning = Chunker::make_balanced_partitioning(2, &[4, 0, 4]);
        assert_cover(&partitioning, 2, 3);
        assert!(partitioning.iter().all(|p| p.banks.first() != Some(&1)));
    }

    #[test]
    fn test_deterministic() {
        let sizes = [13, 2, 9, 9, 1, 0, 27, 4];
        let first = Chunker::make_balanced_partitioning(5, &sizes);
        for _ in 0..5 {
            assert_eq!(Chunker::make_balanced_partitioning(5, &sizes), first);
        }
    }

    #[test]
    fn test_load_ranges_single_bank() {
        let chunker = Chunker::new(1, 0, vec![7], 2).unwrap();
        assert_eq!(
            chunker.make_load_ranges(),
            vec![
                LoadRange::new(0, 0, 2),
                LoadRange::new(0, 2, 2),
                LoadRange::new(0, 4, 2),
                LoadRange::new(0, 6, 1),
            ]
        );
    }

    #[test]
    fn test_load_ranges_padded_to_common_length() {
        let sizes = vec![10, 2];
        let lengths: Vec<usize> = (0..2)
            .map(|worker| {
                Chunker::new(2, worker, sizes.clone(), 1)
                    .unwrap()
                    .make_load_ranges()
                    .len()
            })
            .collect();
        assert_eq!(lengths[0], lengths[1]);
    }

    #[test]
    fn test_zero_bank_has_no_ranges() {
        let chunker = Chunker::new(1, 0, vec![0, 3], 2).unwrap();
        let ranges = chunker.make_load_ranges();
        assert!(ranges.iter().all(|range| range.bank_index == 1));
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_worker_groups() {
        let chunker = Chunker::new(4, 0, vec![30, 5, 5], 1).unwrap();
        let groups = chunker.make_worker_groups();
        let flat: Vec<usize> = groups.iter().flatten().copied().collect();
        assert_eq!(flat, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Chunker::new(0, 0, vec![1], 1).is_err());
        assert!(Chunker::new(2, 2, vec![1], 1).is_err());
        assert!(Chunker::new(2, 0, vec![1], 0).is_err());
    }
}
