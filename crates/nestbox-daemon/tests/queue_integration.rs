#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Execution Queue under sustained load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nestbox_daemon::queue::ExecutionQueue;

const LIMIT: usize = 3;
const GROUPS: usize = 10;
const ITEMS_PER_GROUP: usize = 20;

#[derive(Default)]
struct Probe {
    running: AtomicUsize,
    peak: AtomicUsize,
    per_group: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
    completions: Mutex<Vec<(String, usize)>>,
}

impl Probe {
    fn enter(&self, group: &str) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let mut per_group = self.per_group.lock().unwrap();
        let slot = per_group.entry(group.to_string()).or_default();
        *slot += 1;
        if *slot > 1 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, group: &str, seq: usize) {
        *self
            .per_group
            .lock()
            .unwrap()
            .get_mut(group)
            .unwrap() -= 1;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completions
            .lock()
            .unwrap()
            .push((group.to_string(), seq));
    }
}

fn submit(queue: &ExecutionQueue, probe: &Arc<Probe>, group: &str, seq: usize, fail: bool) {
    let probe = Arc::clone(probe);
    let owned = group.to_string();
    queue
        .submit(group, async move {
            probe.enter(&owned);
            tokio::time::sleep(Duration::from_millis(2)).await;
            probe.leave(&owned, seq);
            assert!(!fail, "simulated failure in {owned}");
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_group_drains_under_load() {
    let queue = ExecutionQueue::new(LIMIT);
    let probe = Arc::new(Probe::default());

    for seq in 0..ITEMS_PER_GROUP {
        for g in 0..GROUPS {
            // Every fifth item panics; later items in the group must still run.
            submit(&queue, &probe, &format!("g{g}"), seq, seq % 5 == 4);
        }
    }
    submit(&queue, &probe, "late", 0, false);

    assert!(queue.wait_idle(Duration::from_secs(30)).await);

    let completions = probe.completions.lock().unwrap().clone();
    assert_eq!(completions.len(), GROUPS * ITEMS_PER_GROUP + 1);
    assert!(probe.peak.load(Ordering::SeqCst) <= LIMIT);
    assert_eq!(probe.overlaps.load(Ordering::SeqCst), 0);

    for g in 0..GROUPS {
        let group = format!("g{g}");
        let order: Vec<usize> = completions
            .iter()
            .filter(|(name, _)| *name == group)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, (0..ITEMS_PER_GROUP).collect::<Vec<_>>());
    }

    // A group arriving last still gets a slot within roughly one rotation.
    let late = completions.iter().position(|(name, _)| name == "late").unwrap();
    assert!(late < GROUPS * 3, "late group finished at position {late}");
}
