//! Key range partitioning.

use log;

use crate::cluster::NodeId;
use crate::record::Record;

/// Returns the number of key bits used to select a partition: `ceil(log2(cluster_size))`.
pub fn partition_bits(cluster_size: usize) -> u32 {
    match cluster_size {
        0 | 1 => 0,
        size => usize::BITS - (size - 1).leading_zeros(),
    }
}

/// Returns the partition a record belongs to: the top `partition_bits(cluster_size)` bits of its first key byte.
///
/// The result is in `0..2^n`. If the cluster size is not a power of two some of the values have no node;
/// see [`PartitionMap::build`] for how those records are routed.
pub fn partition_owner(record: &Record, cluster_size: usize) -> NodeId {
    match partition_bits(cluster_size) {
        0 => 0,
        bits => (record.key()[0] >> (8 - bits.min(8))) as NodeId,
    }
}

/// Records of a local shard grouped by the node owning them.
#[derive(Debug)]
pub struct PartitionMap {
    partitions: Vec<Vec<Record>>,
}

impl PartitionMap {
    /// Splits the records by owner keeping their relative order.
    ///
    /// Records whose partition has no node (the cluster size is not a power of two) are routed to the last node,
    /// which keeps the key ranges of the nodes contiguous and ascending with the node id.
    pub fn build(records: impl IntoIterator<Item = Record>, cluster_size: usize) -> Self {
        let cluster_size = cluster_size.max(1);
        let last = (cluster_size - 1) as NodeId;
        let mut partitions = vec![Vec::new(); cluster_size];
        let mut rerouted = 0usize;

        for record in records.into_iter() {
            let mut owner = partition_owner(&record, cluster_size);
            if owner > last {
                owner = last;
                rerouted += 1;
            }
            partitions[owner as usize].push(record);
        }

        if rerouted > 0 {
            log::debug!("{} records of unowned partitions routed to node {}", rerouted, last);
        }

        return PartitionMap { partitions };
    }

    /// Number of partitions, equal to the cluster size.
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Returns the records assigned to a node.
    pub fn get(&self, id: NodeId) -> &[Record] {
        self.partitions.get(id as usize).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of records assigned to a node.
    pub fn partition_len(&self, id: NodeId) -> usize {
        self.get(id).len()
    }

    /// Moves the records assigned to a node out of the map.
    pub fn take(&mut self, id: NodeId) -> Vec<Record> {
        self.partitions
            .get_mut(id as usize)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;
    use rstest::*;

    use super::{partition_bits, partition_owner, PartitionMap};
    use crate::record::{Record, RECORD_SIZE};

    fn record(first: u8, tag: u8) -> Record {
        let mut bytes = [tag; RECORD_SIZE];
        bytes[0] = first;
        Record::new(bytes)
    }

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(4, 2)]
    #[case(5, 3)]
    #[case(8, 3)]
    #[case(9, 4)]
    #[case(256, 8)]
    fn test_partition_bits(#[case] cluster_size: usize, #[case] expected: u32) {
        assert_eq!(partition_bits(cluster_size), expected);
    }

    #[rstest]
    #[case(0x00, 4, 0)]
    #[case(0x3f, 4, 0)]
    #[case(0x40, 4, 1)]
    #[case(0xbf, 4, 2)]
    #[case(0xc0, 4, 3)]
    #[case(0xff, 3, 3)]
    #[case(0x7f, 2, 0)]
    #[case(0x80, 2, 1)]
    #[case(0xff, 1, 0)]
    fn test_partition_owner(#[case] first: u8, #[case] cluster_size: usize, #[case] expected: u32) {
        assert_eq!(partition_owner(&record(first, 1), cluster_size), expected);
    }

    #[rstest]
    fn test_partition_owner_is_total(#[values(1, 2, 3, 4, 7, 16, 200, 256)] cluster_size: usize) {
        let limit = 1u32 << partition_bits(cluster_size);
        let mut rng = rand::thread_rng();

        for first in 0..=u8::MAX {
            let record = record(first, rng.gen());
            let owner = partition_owner(&record, cluster_size);
            assert!(owner < limit);
            assert_eq!(owner, partition_owner(&record, cluster_size));
        }
    }

    #[test]
    fn test_partition_map_keeps_order() {
        let records = vec![record(0x10, 1), record(0x90, 2), record(0x20, 3), record(0xa0, 4)];

        let mut map = PartitionMap::build(records, 2);

        assert_eq!(map.num_partitions(), 2);
        assert_eq!(map.get(0), &[record(0x10, 1), record(0x20, 3)]);
        assert_eq!(map.partition_len(1), 2);
        assert_eq!(map.take(1), vec![record(0x90, 2), record(0xa0, 4)]);
        assert!(map.get(1).is_empty());
        assert!(map.get(5).is_empty());
    }

    #[test]
    fn test_unowned_partition_routed_to_last_node() {
        let records = vec![record(0x00, 0), record(0x80, 0), record(0xc0, 0), record(0xff, 0)];

        let map = PartitionMap::build(records, 3);

        assert_eq!(map.partition_len(0), 1);
        assert_eq!(map.partition_len(1), 0);
        assert_eq!(map.get(2), &[record(0x80, 0), record(0xc0, 0), record(0xff, 0)]);
    }

    #[test]
    fn test_single_node_owns_everything() {
        let records: Vec<Record> = (0..=u8::MAX).map(|first| record(first, 9)).collect();

        let map = PartitionMap::build(records.clone(), 1);

        assert_eq!(map.get(0), &records[..]);
    }
}
