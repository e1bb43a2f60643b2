//! 分区位点跟踪
//!
//! 多个工作协程乱序完成同一分区的消息，而 Kafka 每个分区只提交一个位点。
//! 跟踪器记录每个分区的在途位点，只暴露连续的低水位作为可提交位点，
//! 保证提交的位点永远不会越过尚未处理完成的消息。

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// (topic, partition)
pub type PartitionKey = (String, i32);

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_completed: Option<i64>,
    /// 最近一次上报的可提交位点，首次登记时取该位点本身
    last_committable: Option<i64>,
}

impl PartitionOffsets {
    /// 下一个待消费位点：最小在途位点，没有在途消息时为最大已完成位点 + 1
    fn committable(&self) -> Option<i64> {
        self.in_flight
            .first()
            .copied()
            .or(self.highest_completed.map(|o| o + 1))
    }
}

#[derive(Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<PartitionKey, PartitionOffsets>>,
    drained: Condvar,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 消息进入工作队列前登记
    pub fn begin(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock();
        let state = partitions.entry((topic.to_string(), partition)).or_default();
        state.in_flight.insert(offset);
        state.last_committable.get_or_insert(offset);
    }

    /// 消息处理完成，可提交位点前进时返回新的位点
    ///
    /// 分区已被回收时返回 None。
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock();
        let state = partitions.get_mut(&(topic.to_string(), partition))?;

        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.highest_completed = Some(state.highest_completed.map_or(offset, |h| h.max(offset)));

        let next = state.committable();
        let advanced = next.is_some() && next > state.last_committable;
        if advanced {
            state.last_committable = next;
        }

        if state.in_flight.is_empty() {
            self.drained.notify_all();
        }

        if advanced { next } else { None }
    }

    /// 指定分区的在途消息数
    pub fn in_flight(&self, partitions: &[PartitionKey]) -> usize {
        let guard = self.partitions.lock();
        partitions
            .iter()
            .filter_map(|key| guard.get(key))
            .map(|state| state.in_flight.len())
            .sum()
    }

    /// 当前可提交位点
    pub fn committable(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .lock()
            .get(&(topic.to_string(), partition))
            .and_then(PartitionOffsets::committable)
    }

    /// 阻塞等待指定分区的在途消息全部完成，超时返回 false
    pub fn wait_drained(&self, partitions: &[PartitionKey], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.partitions.lock();

        loop {
            let pending: usize = partitions
                .iter()
                .filter_map(|key| guard.get(key))
                .map(|state| state.in_flight.len())
                .sum();
            if pending == 0 {
                return true;
            }
            if self.drained.wait_until(&mut guard, deadline).timed_out() {
                return false;
            }
        }
    }

    /// 分区被回收后丢弃其状态
    pub fn release(&self, partitions: &[PartitionKey]) {
        let mut guard = self.partitions.lock();
        for key in partitions {
            guard.remove(key);
        }
        self.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TOPIC: &str = "email-notifications";

    #[test]
    fn test_in_order_completion_advances() {
        let tracker = OffsetTracker::new();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 11);

        assert_eq!(tracker.complete(TOPIC, 0, 10), Some(11));
        assert_eq!(tracker.complete(TOPIC, 0, 11), Some(12));
    }

    #[test]
    fn test_out_of_order_completion_holds_watermark() {
        let tracker = OffsetTracker::new();
        for offset in 10..13 {
            tracker.begin(TOPIC, 0, offset);
        }

        // 10 仍在处理中，11、12 完成也不能越过它
        assert_eq!(tracker.complete(TOPIC, 0, 12), None);
        assert_eq!(tracker.complete(TOPIC, 0, 11), None);
        assert_eq!(tracker.committable(TOPIC, 0), Some(10));

        assert_eq!(tracker.complete(TOPIC, 0, 10), Some(13));
    }

    #[test]
    fn test_first_completion_out_of_order_reports_nothing() {
        let tracker = OffsetTracker::new();
        tracker.begin(TOPIC, 0, 10);
        tracker.begin(TOPIC, 0, 11);

        assert_eq!(tracker.complete(TOPIC, 0, 11), None);
        assert_eq!(tracker.committable(TOPIC, 0), Some(10));
        assert_eq!(tracker.complete(TOPIC, 0, 10), Some(12));
    }

    #[test]
    fn test_reassigned_partition_starts_fresh() {
        let tracker = OffsetTracker::new();
        tracker.begin(TOPIC, 0, 3);
        tracker.release(&[(TOPIC.to_string(), 0)]);

        tracker.begin(TOPIC, 0, 7);
        tracker.begin(TOPIC, 0, 8);
        assert_eq!(tracker.complete(TOPIC, 0, 8), None);
        assert_eq!(tracker.complete(TOPIC, 0, 7), Some(9));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = OffsetTracker::new();
        tracker.begin(TOPIC, 0, 5);
        tracker.begin(TOPIC, 1, 100);

        assert_eq!(tracker.complete(TOPIC, 1, 100), Some(101));
        assert_eq!(tracker.in_flight(&[(TOPIC.to_string(), 0)]), 1);
    }

    #[test]
    fn test_released_partition_is_ignored() {
        let tracker = OffsetTracker::new();
        tracker.begin(TOPIC, 0, 5);
        tracker.release(&[(TOPIC.to_string(), 0)]);

        assert_eq!(tracker.complete(TOPIC, 0, 5), None);
        assert_eq!(tracker.committable(TOPIC, 0), None);
    }

    #[test]
    fn test_wait_drained_times_out() {
        let tracker = OffsetTracker::new();
        tracker.begin(TOPIC, 0, 1);

        let drained = tracker.wait_drained(&[(TOPIC.to_string(), 0)], Duration::from_millis(20));
        assert!(!drained);
    }

    #[test]
    fn test_wait_drained_wakes_on_completion() {
        let tracker = Arc::new(OffsetTracker::new());
        tracker.begin(TOPIC, 0, 1);

        let worker = {
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                tracker.complete(TOPIC, 0, 1);
            })
        };

        assert!(tracker.wait_drained(&[(TOPIC.to_string(), 0)], Duration::from_secs(5)));
        worker.join().unwrap();
    }
}
