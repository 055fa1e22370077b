//! Property tests for the receive loops
//!
//! Random completion sequences, with loop-ending statuses mixed in at any
//! point, must keep exactly one transfer per loop in flight while the device
//! lives, account every delivered byte, and free every transfer exactly once
//! when the device dies.

mod support;

use common::test_utils::{MockDeviceBuilder, MockTransport};
use proptest::prelude::*;
use std::collections::HashSet;
use support::{Harness, distinct_submits};
use transport::{DeviceKey, TransferKind, TransferStatus};

const KEY: DeviceKey = DeviceKey { bus: 1, address: 4 };
const EP_IN: TransferKind = TransferKind::Bulk { endpoint: 0x81 };

#[derive(Debug, Clone)]
enum Step {
    Deliver { slot: usize, len: usize },
    End { slot: usize, status: TransferStatus },
}

fn terminal_status() -> impl Strategy<Value = TransferStatus> {
    prop_oneof![
        Just(TransferStatus::Cancelled),
        Just(TransferStatus::Error),
        Just(TransferStatus::NoDevice),
        Just(TransferStatus::TimedOut),
        Just(TransferStatus::Stall),
        Just(TransferStatus::Overflow),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        8 => (0usize..3, 0usize..2048).prop_map(|(slot, len)| Step::Deliver { slot, len }),
        1 => (0usize..3, terminal_status()).prop_map(|(slot, status)| Step::End { slot, status }),
    ]
}

/// (distinct RX transfers submitted, RX transfers freed, RX transfers pending)
fn rx_accounting(transport: &MockTransport) -> (usize, usize, usize) {
    let log = transport.log();
    let submitted: HashSet<_> = log
        .submits
        .iter()
        .filter(|(k, _, kind)| *k == KEY && *kind == EP_IN)
        .map(|(_, id, _)| *id)
        .collect();
    let freed: Vec<_> = log.freed.iter().filter(|id| submitted.contains(id)).collect();
    let unique: HashSet<_> = freed.iter().collect();
    assert_eq!(unique.len(), freed.len(), "transfer freed twice");

    (
        submitted.len(),
        freed.len(),
        transport.pending_bulk_in_for(KEY).len(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_rx_loops_account_every_transfer(
        steps in prop::collection::vec(step(), 1..24),
        terminal in terminal_status(),
    ) {
        let h = Harness::new(vec![MockDeviceBuilder::apple(1, 4).build()]);
        let device = h.handed_off(KEY);

        let mut expected = 0u64;
        let mut alive = true;
        for step in steps {
            let mut pending = h.transport.pending_bulk_in_for(KEY);
            pending.sort();
            if !alive {
                prop_assert!(pending.is_empty());
                continue;
            }
            prop_assert_eq!(pending.len(), 3);

            match step {
                Step::Deliver { slot, len } => {
                    let data = vec![0x5a; len];
                    prop_assert!(h.transport.complete_bulk_in(pending[slot], TransferStatus::Completed, &data));
                    expected += len as u64;
                    prop_assert!(h.pump_until(|| h.transport.ready_count() == 0));

                    prop_assert_eq!(h.registry.rx_bytes(KEY), Some(expected));
                    prop_assert_eq!(device.rx_in_flight(), 3);
                }
                Step::End { slot, status } => {
                    prop_assert!(h.transport.complete_bulk_in(pending[slot], status, &[]));
                    prop_assert!(h.pump_until(|| device.rx_in_flight() == 0 && h.registry.is_empty()));
                    prop_assert!(device.is_dying());
                    alive = false;
                }
            }

            let (submitted, freed, in_flight) = rx_accounting(&h.transport);
            prop_assert_eq!(submitted, freed + in_flight);
        }

        if alive {
            let victim = h.transport.pending_bulk_in_for(KEY)[0];
            prop_assert!(h.transport.complete_bulk_in(victim, terminal, &[]));
            prop_assert!(h.pump_until(|| device.rx_in_flight() == 0 && h.registry.is_empty()));
            prop_assert!(device.is_dying());
        }

        // resubmission reuses the loop's transfer
        prop_assert_eq!(distinct_submits(&h.transport, KEY, EP_IN), 3);
        prop_assert_eq!(rx_accounting(&h.transport), (3, 3, 0));
        prop_assert!(h.transport.pending_bulk_in().is_empty());
        prop_assert_eq!(h.registry.rx_bytes(KEY), None);
    }
}
