//! Final merge of the node shard.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

use rayon::slice::ParallelSliceMut;

use crate::record::Record;

/// Merging error.
#[derive(Debug)]
pub enum MergeError {
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
}

impl Error for MergeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            MergeError::ThreadPoolBuildError(err) => err,
        })
    }
}

impl Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            MergeError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
        }
    }
}

/// Combines the records received from the peers with the locally owned ones and orders them by key.
pub struct FinalMerger {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
}

impl FinalMerger {
    /// Creates a new merger instance.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    pub fn new(threads_number: Option<usize>) -> Result<Self, MergeError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| MergeError::ThreadPoolBuildError(err))?;

        return Ok(FinalMerger { thread_pool });
    }

    /// Returns all the records ordered by their key prefix.
    ///
    /// Records with equal keys are kept, in no particular order.
    pub fn merge(&self, mut aggregated: Vec<Record>, local: Vec<Record>) -> Vec<Record> {
        aggregated.extend(local);

        log::debug!("sorting {} records ...", aggregated.len());
        self.thread_pool.install(|| {
            aggregated.par_sort_unstable_by(Record::cmp_key);
        });

        return aggregated;
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rand::Rng;
    use rstest::*;

    use super::FinalMerger;
    use crate::record::{Record, KEY_SIZE, RECORD_SIZE};

    fn random_records(count: usize, key_alphabet: u8) -> Vec<Record> {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let mut bytes = [0u8; RECORD_SIZE];
                rng.fill(&mut bytes[..]);
                for b in &mut bytes[..KEY_SIZE] {
                    *b %= key_alphabet;
                }
                Record::new(bytes)
            })
            .collect()
    }

    fn sorted_bytes(records: &[Record]) -> Vec<Vec<u8>> {
        let mut bytes: Vec<Vec<u8>> = records.iter().map(|r| r.as_bytes().to_vec()).collect();
        bytes.sort();
        bytes
    }

    #[rstest]
    #[case(None, 0, 0)]
    #[case(Some(1), 10, 0)]
    #[case(Some(2), 0, 10)]
    #[case(Some(4), 500, 300)]
    fn test_merge_orders_by_key(
        #[case] threads: Option<usize>,
        #[case] aggregated: usize,
        #[case] local: usize,
    ) {
        let merger = FinalMerger::new(threads).unwrap();
        let aggregated = random_records(aggregated, u8::MAX);
        let local = random_records(local, u8::MAX);
        let mut all = aggregated.clone();
        all.extend(local.clone());

        let merged = merger.merge(aggregated, local);

        assert!(merged.windows(2).all(|w| w[0].key() <= w[1].key()));
        assert_eq!(sorted_bytes(&merged), sorted_bytes(&all));
    }

    #[test]
    fn test_merge_keeps_duplicate_keys() {
        let merger = FinalMerger::new(Some(2)).unwrap();
        // two-letter alphabet makes colliding keys likely
        let mut records = random_records(200, 2);
        let duplicate = records[0].clone();
        records.push(duplicate.clone());
        records.shuffle(&mut rand::thread_rng());

        let merged = merger.merge(records.clone(), Vec::new());

        assert_eq!(merged.len(), 201);
        assert!(merged.iter().filter(|r| **r == duplicate).count() >= 2);
        assert!(merged.windows(2).all(|w| w[0].key() <= w[1].key()));
        assert_eq!(sorted_bytes(&merged), sorted_bytes(&records));
    }

    #[test]
    fn test_merge_single_node_equals_sorted_shard() {
        let merger = FinalMerger::new(None).unwrap();
        let shard = random_records(64, u8::MAX);
        let mut expected = shard.clone();
        expected.sort_by(Record::cmp_key);

        let merged = merger.merge(Vec::new(), shard);

        let keys = |records: &[Record]| records.iter().map(|r| r.key().to_vec()).collect::<Vec<_>>();
        assert_eq!(keys(&merged[..]), keys(&expected[..]));
    }
}
