// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the semaphore table
//! OWNERS: @kernel-sync-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Allocation never exceeds capacity and fails only when full
//!   - `count` never goes negative; waits never consume from an empty semaphore
//!   - N waiters and M posters settle at min(V+M, N) completions
//!
//! TEST_SCENARIOS:
//!   - allocation_respects_capacity(): random allocate/deallocate interleavings
//!   - try_counts_match_model(): non-blocking waits against a counter model
//!   - waiters_and_posters_settle(): threaded waiters/posters with late kill of leftovers

use super::{SemError, SemHandle, SemaphoreTable};
use crate::sync::testing::ThreadSleeper;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use proptest::prelude::*;
use std::time::{Duration, Instant};

const CAP: usize = 6;

proptest! {
    #[test]
    fn allocation_respects_capacity(ops in proptest::collection::vec(any::<(bool, u8)>(), 1..128)) {
        let table: SemaphoreTable<CAP> = SemaphoreTable::new();
        let mut live: Vec<SemHandle> = Vec::new();
        for (alloc, pick) in ops {
            if alloc {
                match table.allocate() {
                    Ok(handle) => live.push(handle),
                    Err(err) => {
                        prop_assert_eq!(err, SemError::Exhausted);
                        prop_assert_eq!(live.len(), CAP);
                    }
                }
            } else if !live.is_empty() {
                let handle = live.swap_remove(pick as usize % live.len());
                table.deallocate(handle);
            } else {
                table.deallocate(SemHandle::from_raw(pick as u32 + CAP as u32));
            }
            prop_assert!(table.in_use() <= CAP);
            prop_assert_eq!(table.in_use(), live.len());
        }
    }

    #[test]
    fn try_counts_match_model(initial in 0u32..8, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
        let table: SemaphoreTable<1> = SemaphoreTable::new();
        let sem = table.allocate().unwrap();
        table.init(sem, initial).unwrap();
        // A killed sleeper turns `wait` into a non-blocking attempt.
        let sleeper = ThreadSleeper::default();
        sleeper.kill();
        let mut model = initial;
        for post in ops {
            if post {
                table.post(sem).unwrap();
                model += 1;
            } else if model == 0 {
                prop_assert_eq!(table.wait(sem, &sleeper), Err(SemError::Killed));
            } else {
                prop_assert_eq!(table.wait(sem, &sleeper), Ok(()));
                model -= 1;
            }
            prop_assert_eq!(table.count(sem), Ok(model));
        }
    }
}

fn run_waiters_and_posters(initial: u32, waiters: usize, posters: usize) {
    let table: Arc<SemaphoreTable<2>> = Arc::new(SemaphoreTable::new());
    let sem = table.allocate().unwrap();
    table.init(sem, initial).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));
    let sleepers: Vec<Arc<ThreadSleeper>> =
        (0..waiters).map(|_| Arc::new(ThreadSleeper::default())).collect();

    let waiter_threads: Vec<_> = sleepers
        .iter()
        .map(|sleeper| {
            let (table, completed, sleeper) =
                (Arc::clone(&table), Arc::clone(&completed), Arc::clone(sleeper));
            std::thread::spawn(move || {
                let result = table.wait(sem, &*sleeper);
                if result.is_ok() {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
                result
            })
        })
        .collect();
    let poster_threads: Vec<_> = (0..posters)
        .map(|_| {
            let table = Arc::clone(&table);
            std::thread::spawn(move || table.post(sem))
        })
        .collect();
    for poster in poster_threads {
        assert_eq!(poster.join().unwrap(), Ok(()));
    }

    let total = initial as usize + posters;
    let expected = total.min(waiters);
    let deadline = Instant::now() + Duration::from_secs(10);
    while completed.load(Ordering::SeqCst) < expected {
        assert!(Instant::now() < deadline, "waiters did not drain");
        std::thread::yield_now();
    }
    for sleeper in &sleepers {
        sleeper.kill();
    }
    let mut killed = 0;
    for waiter in waiter_threads {
        match waiter.join().unwrap() {
            Ok(()) => {}
            Err(SemError::Killed) => killed += 1,
            Err(other) => panic!("unexpected wait error {:?}", other),
        }
    }
    assert_eq!(completed.load(Ordering::SeqCst), expected);
    assert_eq!(killed, waiters - expected);
    assert_eq!(table.count(sem), Ok(total.saturating_sub(waiters) as u32));
}

#[test]
fn waiters_and_posters_settle() {
    for &(initial, waiters, posters) in
        &[(0, 4, 4), (0, 6, 3), (2, 3, 5), (1, 5, 0), (0, 0, 3), (3, 8, 2)]
    {
        run_waiters_and_posters(initial, waiters, posters);
    }
}
