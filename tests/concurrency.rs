//! Concurrent callers racing on the same counter, balance, transfer and approval request.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use common::{spawn, stock};
use stock_control::{
    CoreError,
    approval::{ApprovalAction, ApprovalFilter, ApprovalStatus, Fingerprint},
    authz::{Actor, Role},
    ledger::{Movement, TransactionType},
    transfer::{TransferLine, TransferRequest, TransferStatus},
};

const THREADS: usize = 8;

#[test]
fn concurrent_sequence_allocation_has_no_gaps_or_duplicates() -> anyhow::Result<()> {
    let env = spawn()?;
    let sequences = &env.services.sequences;

    let allocated = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    (0..25)
                        .map(|_| sequences.next("INV", "MH", "2425"))
                        .collect::<Result<Vec<u64>, _>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let all: Vec<u64> = allocated.into_iter().flatten().collect();
    let distinct: BTreeSet<u64> = all.iter().copied().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(distinct, (1..=200).collect());
    assert_eq!(sequences.peek("INV", "MH", "2425")?, 200);
    Ok(())
}

#[test]
fn concurrent_receipts_serialize_on_one_balance() -> anyhow::Result<()> {
    let env = spawn()?;
    let ledger = &env.services.ledger;

    thread::scope(|s| {
        for t in 0..THREADS {
            s.spawn(move || {
                for n in 0..10 {
                    ledger
                        .post_movement(Movement::inbound(
                            "X",
                            "A",
                            3,
                            TransactionType::Purchase,
                            "grn",
                            format!("GRN-{t}-{n}"),
                        ))
                        .expect("receipt failed");
                }
            });
        }
    });

    assert_eq!(ledger.get_balance("X", "A")?, 3 * 10 * THREADS as u64);
    assert_eq!(ledger.verify("X", "A")?, 240);

    let sequences: Vec<u64> = ledger.entries("X", "A")?.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=80).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn concurrent_issues_never_oversell() -> anyhow::Result<()> {
    let env = spawn()?;
    let ledger = &env.services.ledger;
    stock(ledger, "X", "A", 100)?;

    let accepted = AtomicUsize::new(0);
    let refused = AtomicUsize::new(0);
    thread::scope(|s| {
        for t in 0..THREADS {
            let (accepted, refused) = (&accepted, &refused);
            s.spawn(move || {
                for n in 0..20 {
                    let sale = Movement::outbound(
                        "X",
                        "A",
                        1,
                        TransactionType::Sale,
                        "invoice",
                        format!("INV-{t}-{n}"),
                    );
                    match ledger.post_movement(sale) {
                        Ok(_) => accepted.fetch_add(1, Ordering::SeqCst),
                        Err(CoreError::InsufficientStock { .. }) => {
                            refused.fetch_add(1, Ordering::SeqCst)
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    };
                }
            });
        }
    });

    assert_eq!(accepted.load(Ordering::SeqCst), 100);
    assert_eq!(refused.load(Ordering::SeqCst), 60);
    assert_eq!(ledger.get_balance("X", "A")?, 0);
    assert_eq!(ledger.verify("X", "A")?, 0);
    Ok(())
}

#[test]
fn concurrent_dispatches_post_once() -> anyhow::Result<()> {
    let env = spawn()?;
    let svc = &env.services;
    stock(&svc.ledger, "X", "A", 10)?;

    let transfer = svc.transfers.create(TransferRequest::new(
        "A",
        "B",
        vec![TransferLine::new("X", 6)],
        "planner",
    ))?;

    let wins = AtomicUsize::new(0);
    thread::scope(|s| {
        for t in 0..THREADS {
            let (wins, id) = (&wins, &transfer.id);
            s.spawn(move || match svc.transfers.dispatch(id, &format!("keeper-{t}")) {
                Ok(_) => {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
                Err(CoreError::InvalidStateTransition { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            });
        }
    });

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(svc.transfers.get(&transfer.id)?.status, TransferStatus::InTransit);
    assert_eq!(svc.ledger.get_balance("X", "A")?, 4);
    assert_eq!(svc.ledger.entries("X", "A")?.len(), 2);
    Ok(())
}

fn scrap_action(work_order: &str, requested_by: &str) -> ApprovalAction {
    ApprovalAction {
        fingerprint: Fingerprint::new("production", "work_order", work_order, "post_entry"),
        condition: ">7%".to_string(),
        approver_role: Role::new("production_manager"),
        requested_by: requested_by.to_string(),
        payload: Vec::new(),
    }
}

#[test]
fn concurrent_requests_for_one_action_create_one_request() -> anyhow::Result<()> {
    let env = spawn()?;
    let gate = &env.services.approvals;

    let ids = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                s.spawn(move || {
                    let decision = gate.check_or_request(scrap_action("WO-1", &format!("op-{t}")))?;
                    assert!(!decision.is_authorized());
                    Ok::<_, CoreError>(decision.request_id().to_string())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<Result<BTreeSet<_>, _>>()
    })?;

    assert_eq!(ids.len(), 1);
    let admin = Actor::new("root", "admin");
    let pending = gate.list(
        &admin,
        &ApprovalFilter {
            status: Some(ApprovalStatus::Pending),
            ..Default::default()
        },
    )?;
    assert_eq!(pending.len(), 1);
    Ok(())
}

#[test]
fn racing_decisions_have_exactly_one_winner() -> anyhow::Result<()> {
    let env = spawn()?;
    let gate = &env.services.approvals;

    let request_id = gate
        .check_or_request(scrap_action("WO-2", "op-1"))?
        .request_id()
        .to_string();

    let approver = Actor::new("pm-1", "production_manager");
    let rejecter = Actor::new("root", "admin");
    let (approved, rejected) = thread::scope(|s| {
        let a = s.spawn(|| gate.approve(&request_id, &approver));
        let r = s.spawn(|| gate.reject(&request_id, &rejecter, Some("too much scrap".into())));
        (
            a.join().expect("approver panicked"),
            r.join().expect("rejecter panicked"),
        )
    });

    let stored = gate.get(&request_id)?;
    match (approved, rejected) {
        (Ok(winner), Err(CoreError::AlreadyDecided { .. })) => {
            assert_eq!(stored.status, ApprovalStatus::Approved);
            assert_eq!(winner, stored);
        }
        (Err(CoreError::AlreadyDecided { .. }), Ok(winner)) => {
            assert_eq!(stored.status, ApprovalStatus::Rejected);
            assert_eq!(winner, stored);
        }
        other => panic!("expected exactly one decision to win, got {other:?}"),
    }
    Ok(())
}
