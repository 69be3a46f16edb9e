use crate::{Error, PartitionSet, StateError, StateTable};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::thread::scope;

#[test]
fn empty_subset_uses_every_partition() {
    let set = PartitionSet::new(4, &[]).unwrap();
    assert_eq!(set.full_part_count(), 4);
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert!((0..4).all(|id| set.is_used(id)));
    assert!(!set.is_used(4));
}

#[test]
fn declared_zero_becomes_one() {
    let set = PartitionSet::new(0, &[]).unwrap();
    assert_eq!(set.full_part_count(), 1);
    assert_eq!(set.len(), 1);
    assert!(set.is_used(0));
}

#[test]
fn subset_is_sorted_and_deduplicated() {
    let set = PartitionSet::new(8, &[5, 1, 5, 3]).unwrap();
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3, 5]);
    assert!(!set.is_used(0));
    assert!(set.is_used(3));
    assert_eq!(set.to_string(), "part_count: 8, used: [1, 3, 5]");
}

#[test]
fn subset_out_of_range_is_rejected() {
    let err = PartitionSet::new(2, &[0, 2]).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidPartition {
            part_id: 2,
            part_count: 2
        }
    ));
}

#[test]
fn iteration_is_restartable() {
    let set = PartitionSet::new(3, &[]).unwrap();
    let first: Vec<_> = (&set).into_iter().collect();
    let second: Vec<_> = set.iter().collect();
    assert_eq!(first, second);
}

#[test]
fn outbound_close_is_one_shot() {
    let table = StateTable::new(2);
    assert!(!table.outbound_closed(1));
    table.set_outbound_closed(1).unwrap();
    assert!(table.outbound_closed(1));
    assert_eq!(
        table.set_outbound_closed(1),
        Err(StateError::OutboundAlreadyClosed { part_id: 1 })
    );
    assert!(!table.outbound_closed(0));
}

#[test]
fn collected_claimed_once() {
    let table = StateTable::new(1);
    assert!(table.set_collected(0));
    assert!(!table.set_collected(0));
}

#[test]
fn receive_cancel_sets_cancelled() {
    let table = StateTable::new(3);
    assert!(!table.cancelled(2));
    table.receive_cancel(2);
    table.receive_cancel(2);
    assert!(table.cancelled(2));
    assert!(!table.cancelled(1));
}

#[test]
fn closed_covers_natural_forced_and_abandoned() {
    let table = StateTable::new(3);
    assert!(table.set_inbound_closed(0));
    assert!(table.set_forced_eof(1));
    assert!(table.set_abandoned(2));
    assert!((0..3).all(|id| table.closed(id)));
    assert!(!table.set_inbound_closed(0));
}

#[test]
fn concurrent_transition_has_single_winner() {
    const THREADS: usize = 8;

    let table = Arc::new(StateTable::new(4));
    let wins = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));

    scope(|s| {
        for _ in 0..THREADS {
            let table = Arc::clone(&table);
            let wins = Arc::clone(&wins);
            let violations = Arc::clone(&violations);
            s.spawn(move || {
                for part_id in 0..4 {
                    match table.set_outbound_closed(part_id) {
                        Ok(()) => wins.fetch_add(1, Ordering::Relaxed),
                        Err(_) => violations.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    assert_eq!(wins.load(Ordering::Relaxed), 4);
    assert_eq!(violations.load(Ordering::Relaxed), 4 * (THREADS - 1));
}

#[test]
fn lock_is_released_on_scope_exit() {
    let table = StateTable::new(1);
    {
        let _guard = table.lock(0);
    }
    let result: Result<(), ()> = (|| {
        let _guard = table.lock(0);
        Err(())
    })();
    assert!(result.is_err());
    // Would deadlock if either guard leaked.
    drop(table.lock(0));
}
