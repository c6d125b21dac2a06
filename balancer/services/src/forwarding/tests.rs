use super::*;
use crate::{tests::mk_service, NetConfig, ServiceController, ServiceMetrics};
use flux_balancer_core::{
    mem::{MemoryTable, Op},
    ErrorSink,
};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn mk_ctx(table: &Arc<MemoryTable>) -> Context {
    Context::new(
        table.clone(),
        NetConfig::default(),
        ErrorSink::log_only(),
        ServiceMetrics::default(),
    )
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn installed(slots: BTreeMap<SocketAddr, u32>) -> BTreeMap<SocketAddr, Installed> {
    slots
        .into_iter()
        .map(|(endpoint, slot)| {
            let installed = Installed {
                slot,
                rule: RuleSpec::default(),
            };
            (endpoint, installed)
        })
        .collect()
}

fn dnat(mark: u32, endpoint: &str) -> RuleSpec {
    RuleSpec::destination(Protocol::Tcp, "10.0.0.5".parse().unwrap(), 80)
        .arg("-m")
        .arg("mark")
        .arg("--mark")
        .arg(format!("{mark:#x}"))
        .arg("-j")
        .arg("DNAT")
        .arg("--to-destination")
        .arg(endpoint)
}

fn assert_adds_precede_deletes(journal: &[Op]) {
    if let Some(first_delete) = journal.iter().position(|op| !op.is_add()) {
        assert!(
            journal[first_delete..].iter().all(|op| !op.is_add()),
            "{journal:#?}"
        );
    }
}

#[test]
fn new_endpoints_fill_free_slots() {
    let current = installed(btreemap! {
        addr("10.0.0.10:80") => 0,
        addr("10.0.0.11:80") => 1,
    });
    let endpoints = [addr("10.0.0.11:80"), addr("10.0.0.12:80")]
        .into_iter()
        .collect();

    assert_eq!(
        assign_slots(&current, &endpoints),
        btreemap! {
            addr("10.0.0.11:80") => 1,
            addr("10.0.0.12:80") => 0,
        }
    );
}

#[test]
fn out_of_range_slots_are_compacted() {
    let current = installed(btreemap! {
        addr("10.0.0.10:80") => 0,
        addr("10.0.0.11:80") => 1,
        addr("10.0.0.12:80") => 2,
    });
    let endpoints = [addr("10.0.0.10:80"), addr("10.0.0.12:80")]
        .into_iter()
        .collect();

    assert_eq!(
        assign_slots(&current, &endpoints),
        btreemap! {
            addr("10.0.0.10:80") => 0,
            addr("10.0.0.12:80") => 1,
        }
    );
}

#[test]
fn fresh_endpoints_are_assigned_in_order() {
    let endpoints = [
        addr("10.0.0.12:80"),
        addr("10.0.0.10:80"),
        addr("10.0.0.11:80"),
    ]
    .into_iter()
    .collect();

    assert_eq!(
        assign_slots(&BTreeMap::new(), &endpoints),
        btreemap! {
            addr("10.0.0.10:80") => 0,
            addr("10.0.0.11:80") => 1,
            addr("10.0.0.12:80") => 2,
        }
    );
}

#[tokio::test]
async fn synthesizes_classifier_and_instance_rules() {
    let table = Arc::new(MemoryTable::default());
    let ctx = mk_ctx(&table);

    let svc = mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.11:8080"]);
    let forwarding = Forwarding::start(&ctx, &svc, addr("10.0.0.5:80"))
        .await
        .unwrap();

    assert_eq!(
        forwarding.slots(),
        btreemap! {
            addr("10.0.0.10:8080") => 0,
            addr("10.0.0.11:8080") => 1,
        }
    );
    assert_eq!(
        table
            .rules(Table::Mangle)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec![
            "-p tcp -d 10.0.0.5 --dport 80 -j HMARK --hmark-tuple src,sport,dst,dport \
             --hmark-mod 2 --hmark-offset 0x1000 --hmark-rnd 0xf1ec"
        ]
    );
    assert_eq!(
        table.rules(Table::Nat),
        vec![dnat(0x1000, "10.0.0.10:8080"), dnat(0x1001, "10.0.0.11:8080")]
    );
}

#[tokio::test]
async fn replacing_an_instance_touches_only_its_rule() {
    let table = Arc::new(MemoryTable::default());
    let mut controller = ServiceController::start(
        mk_ctx(&table),
        &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.11:8080"]),
    )
    .await
    .unwrap();
    table.take_journal();

    controller
        .update(&mk_service(
            "svc",
            Some("10.0.0.5"),
            80,
            ["10.0.0.11:8080", "10.0.0.12:8080"],
        ))
        .await
        .unwrap();

    assert_eq!(
        table.take_journal(),
        vec![
            Op::Add(Table::Nat, dnat(0x1000, "10.0.0.12:8080")),
            Op::Delete(Table::Nat, dnat(0x1000, "10.0.0.10:8080")),
        ]
    );
    assert_eq!(
        table.rules(Table::Nat),
        vec![dnat(0x1001, "10.0.0.11:8080"), dnat(0x1000, "10.0.0.12:8080")]
    );
}

#[tokio::test]
async fn adding_an_instance_replaces_the_classifier() {
    let table = Arc::new(MemoryTable::default());
    let ctx = mk_ctx(&table);
    let mut forwarding = Forwarding::start(
        &ctx,
        &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080"]),
        addr("10.0.0.5:80"),
    )
    .await
    .unwrap();
    let prior_classifier = table.rules(Table::Mangle).remove(0);
    table.take_journal();

    let handled = forwarding
        .update(
            &ctx,
            &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.11:8080"]),
        )
        .await
        .unwrap();
    assert!(handled);

    let journal = table.take_journal();
    assert_eq!(journal.len(), 3, "{journal:#?}");
    assert_eq!(journal[0], Op::Add(Table::Nat, dnat(0x1001, "10.0.0.11:8080")));
    assert!(matches!(journal[1], Op::Add(Table::Mangle, _)));
    assert_eq!(journal[2], Op::Delete(Table::Mangle, prior_classifier));
    assert_eq!(table.rules(Table::Nat).len(), 2);
}

#[tokio::test]
async fn removing_an_instance_compacts_slots() {
    let table = Arc::new(MemoryTable::default());
    let ctx = mk_ctx(&table);
    let mut forwarding = Forwarding::start(
        &ctx,
        &mk_service(
            "svc",
            Some("10.0.0.5"),
            80,
            ["10.0.0.10:8080", "10.0.0.11:8080", "10.0.0.12:8080"],
        ),
        addr("10.0.0.5:80"),
    )
    .await
    .unwrap();
    table.take_journal();

    forwarding
        .update(
            &ctx,
            &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.12:8080"]),
        )
        .await
        .unwrap();

    assert_eq!(
        forwarding.slots(),
        btreemap! {
            addr("10.0.0.10:8080") => 0,
            addr("10.0.0.12:8080") => 1,
        }
    );
    assert_adds_precede_deletes(&table.take_journal());
    assert_eq!(
        table.rules(Table::Nat),
        vec![dnat(0x1000, "10.0.0.10:8080"), dnat(0x1001, "10.0.0.12:8080")]
    );
    assert_eq!(table.rules(Table::Mangle).len(), 1);
}

#[tokio::test]
async fn address_change_replaces_all_rules() {
    let table = Arc::new(MemoryTable::default());
    let ctx = mk_ctx(&table);
    let mut forwarding = Forwarding::start(
        &ctx,
        &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080"]),
        addr("10.0.0.5:80"),
    )
    .await
    .unwrap();
    table.take_journal();

    forwarding
        .update(
            &ctx,
            &mk_service("svc", Some("10.0.0.6"), 80, ["10.0.0.10:8080"]),
        )
        .await
        .unwrap();

    let journal = table.take_journal();
    assert_eq!(journal.len(), 4, "{journal:#?}");
    assert_adds_precede_deletes(&journal);
    assert!(table
        .rules(Table::Nat)
        .iter()
        .all(|rule| rule.args().contains(&"10.0.0.6".to_string())));
}

#[tokio::test]
async fn declines_services_without_instances() {
    let table = Arc::new(MemoryTable::default());
    let ctx = mk_ctx(&table);
    let mut forwarding = Forwarding::start(
        &ctx,
        &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080"]),
        addr("10.0.0.5:80"),
    )
    .await
    .unwrap();
    table.take_journal();

    for svc in [
        mk_service("svc", Some("10.0.0.5"), 80, []),
        mk_service("svc", None, 80, ["10.0.0.10:8080"]),
    ] {
        let handled = forwarding.update(&ctx, &svc).await.unwrap();
        assert!(!handled);
    }
    assert!(table.journal().is_empty());

    forwarding.stop(&ctx).await;
    assert!(table.is_empty());
}

#[tokio::test]
async fn failed_classifier_install_rolls_back_new_instances() {
    let table = Arc::new(MemoryTable::default());
    let ctx = mk_ctx(&table);
    let mut forwarding = Forwarding::start(
        &ctx,
        &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080"]),
        addr("10.0.0.5:80"),
    )
    .await
    .unwrap();
    let nat = table.rules(Table::Nat);
    let mangle = table.rules(Table::Mangle);
    table.take_journal();

    // The new instance's DNAT rule is added before the classifier install fails.
    table.fail_adds_to(Table::Mangle, true);
    forwarding
        .update(
            &ctx,
            &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.11:8080"]),
        )
        .await
        .expect_err("the classifier install must fail");

    assert_eq!(
        table.take_journal(),
        vec![
            Op::Add(Table::Nat, dnat(0x1001, "10.0.0.11:8080")),
            Op::Delete(Table::Nat, dnat(0x1001, "10.0.0.11:8080")),
        ]
    );
    assert_eq!(table.rules(Table::Nat), nat);
    assert_eq!(table.rules(Table::Mangle), mangle);
    assert_eq!(
        forwarding.slots(),
        btreemap! { addr("10.0.0.10:8080") => 0 }
    );

    // The next update retries from the last good state.
    table.fail_adds_to(Table::Mangle, false);
    forwarding
        .update(
            &ctx,
            &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.11:8080"]),
        )
        .await
        .unwrap();
    assert_eq!(table.rules(Table::Nat).len(), 2);
    assert_eq!(table.rules(Table::Mangle).len(), 1);
}

#[tokio::test]
async fn overflowing_marks_are_refused() {
    let table = Arc::new(MemoryTable::default());
    let ctx = Context::new(
        table.clone(),
        NetConfig {
            mark_base: u32::MAX,
            ..NetConfig::default()
        },
        ErrorSink::log_only(),
        ServiceMetrics::default(),
    );

    let error = Forwarding::start(
        &ctx,
        &mk_service("svc", Some("10.0.0.5"), 80, ["10.0.0.10:8080", "10.0.0.11:8080"]),
        addr("10.0.0.5:80"),
    )
    .await
    .expect_err("marks must not wrap");
    assert!(
        matches!(error, Error::MarkRange { base: u32::MAX, count: 2 }),
        "{error}"
    );
    assert!(table.journal().is_empty());
}

#[test]
fn net_config_requires_room_for_marks() {
    assert!(NetConfig::default().validate().is_ok());
    assert!(NetConfig {
        mark_base: u32::MAX - NetConfig::MAX_INSTANCES + 1,
        ..NetConfig::default()
    }
    .validate()
    .is_err());
}
