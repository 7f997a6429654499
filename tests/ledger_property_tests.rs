//! Property-based tests for the stock ledger.
//!
//! Random movement sequences are posted against a temporary database. Whatever mix of
//! accepted and rejected movements a sequence produces, the materialised balance must equal
//! a replay of the entries, and the per-item total must equal the sum over warehouses.

use std::collections::HashMap;

use proptest::prelude::*;
use stock_control::{
    CoreError, Services,
    config::CoreConfig,
    ledger::{Movement, TransactionType},
    sequence::DocumentNumber,
};

const ITEMS: [&str; 2] = ["RM-1", "RM-2"];
const WAREHOUSES: [&str; 3] = ["A", "B", "C"];

#[derive(Debug, Clone)]
struct Op {
    item: usize,
    warehouse: usize,
    qty: u64,
    kind: TransactionType,
}

fn kind_strategy() -> impl Strategy<Value = TransactionType> {
    prop_oneof![
        Just(TransactionType::Purchase),
        Just(TransactionType::SalesReturn),
        Just(TransactionType::AdjustmentIn),
        Just(TransactionType::Sale),
        Just(TransactionType::AdjustmentOut),
        Just(TransactionType::ProductionOut),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (0..ITEMS.len(), 0..WAREHOUSES.len(), 1u64..50, kind_strategy()).prop_map(
        |(item, warehouse, qty, kind)| Op {
            item,
            warehouse,
            qty,
            kind,
        },
    )
}

fn movement(op: &Op, n: usize) -> Movement {
    let reference = format!("REF-{n}");
    if op.kind.is_outbound() {
        Movement::outbound(ITEMS[op.item], WAREHOUSES[op.warehouse], op.qty, op.kind, "test", reference)
    } else {
        Movement::inbound(ITEMS[op.item], WAREHOUSES[op.warehouse], op.qty, op.kind, "test", reference)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The stored balance always equals the replayed ledger and never goes negative.
    #[test]
    fn prop_balance_matches_ledger_replay(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let services = Services::open(&CoreConfig::temporary()).unwrap();
        let ledger = &services.ledger;
        let mut model: HashMap<(usize, usize), u64> = HashMap::new();

        for (n, op) in ops.iter().enumerate() {
            let current = model.entry((op.item, op.warehouse)).or_default();
            match ledger.post_movement(movement(op, n)) {
                Ok(entry) => {
                    if op.kind.is_outbound() {
                        *current -= op.qty;
                    } else {
                        *current += op.qty;
                    }
                    prop_assert_eq!(entry.balance_qty, *current);
                }
                Err(CoreError::InsufficientStock { available, requested, .. }) => {
                    prop_assert!(op.kind.is_outbound());
                    prop_assert_eq!(available, *current);
                    prop_assert_eq!(requested, op.qty);
                    prop_assert!(available < requested);
                }
                Err(e) => return Err(TestCaseError::fail(format!("unexpected error: {e}"))),
            }
        }

        for item in 0..ITEMS.len() {
            for warehouse in 0..WAREHOUSES.len() {
                let expected = model.get(&(item, warehouse)).copied().unwrap_or(0);
                let replayed = ledger.verify(ITEMS[item], WAREHOUSES[warehouse]).unwrap();
                prop_assert_eq!(replayed, expected);
            }
        }
    }

    /// The denormalised item total agrees with the per-warehouse balances.
    #[test]
    fn prop_item_total_is_sum_of_warehouses(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let services = Services::open(&CoreConfig::temporary()).unwrap();
        let ledger = &services.ledger;

        for (n, op) in ops.iter().enumerate() {
            // rejected outbound movements are part of the property
            let _ = ledger.post_movement(movement(op, n));
        }

        for item in ITEMS {
            prop_assert_eq!(
                ledger.item_total(item).unwrap(),
                ledger.total_across_warehouses(item).unwrap()
            );
        }
    }

    /// Formatted document numbers parse back into their parts.
    #[test]
    fn prop_document_number_parses_back(
        doc in "[A-Z]{2,5}",
        branch in "[A-Z]{2,3}",
        start in 0u32..99,
        count in 1usize..5,
    ) {
        let services = Services::open(&CoreConfig::temporary()).unwrap();
        let fy = format!("{:02}{:02}", start, (start + 1) % 100);

        for expected in 1..=count as u64 {
            let seq = services.sequences.next(&doc, &branch, &fy).unwrap();
            prop_assert_eq!(seq, expected);

            let formatted = services.sequences.format(&doc, &branch, &fy, seq, None);
            let parsed = DocumentNumber::parse(&formatted).unwrap();
            prop_assert_eq!(&parsed.document_type, &doc);
            prop_assert_eq!(&parsed.branch_code, &branch);
            prop_assert_eq!(&parsed.fiscal_year_code, &fy);
            prop_assert_eq!(parsed.sequence, seq);
            prop_assert_eq!(parsed.to_string(), formatted);
        }
    }
}
