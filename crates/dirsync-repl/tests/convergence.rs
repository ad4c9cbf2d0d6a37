//! Replicas that see the same set of updates end in the same state,
//! whatever order the updates arrive in.

mod common;

use common::{attrs, interleave, topology, under_base, TestReplica};
use dirsync_repl::operation::{Modification, Operation};
use dirsync_repl::UpdateMsg;
use proptest::prelude::*;

const VALUES: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone)]
enum Step {
    SetDisplayName(&'static str),
    Add(&'static str, &'static str),
    Delete(&'static str, &'static str),
    DeleteAll(&'static str),
    Replace(&'static str, Vec<&'static str>),
    DeleteEntry,
}

impl Step {
    fn op(&self) -> Operation {
        let target = under_base("cn=alice");
        let m = match self {
            Step::SetDisplayName(v) => Modification::replace("displayName", &[*v]),
            Step::Add(attr, v) => Modification::add(attr, &[*v]),
            Step::Delete(attr, v) => Modification::delete(attr, &[*v]),
            Step::DeleteAll(attr) => Modification::delete(attr, &[]),
            Step::Replace(attr, vs) => Modification::replace(attr, vs),
            Step::DeleteEntry => return Operation::delete(target),
        };
        Operation::modify(target, vec![m])
    }
}

fn value() -> impl Strategy<Value = &'static str> {
    prop::sample::select(VALUES.to_vec())
}

fn multi_attr() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["mail", "description"])
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => value().prop_map(Step::SetDisplayName),
        3 => (multi_attr(), value()).prop_map(|(a, v)| Step::Add(a, v)),
        2 => (multi_attr(), value()).prop_map(|(a, v)| Step::Delete(a, v)),
        1 => multi_attr().prop_map(Step::DeleteAll),
        2 => (multi_attr(), prop::collection::vec(value(), 0..3)).prop_map(|(a, mut vs)| {
            vs.sort_unstable();
            vs.dedup();
            Step::Replace(a, vs)
        }),
        1 => Just(Step::DeleteEntry),
    ]
}

fn seed_op() -> Operation {
    Operation::add(
        under_base("cn=alice"),
        attrs(&[
            ("objectClass", "person"),
            ("cn", "alice"),
            ("mail", "a"),
            ("description", "b"),
        ]),
    )
}

/// Seed the entry on every replica, run `steps` locally, return the seed
/// and the published updates per origin.
async fn run_locally(
    replicas: &mut [TestReplica],
    steps: &[(usize, Step)],
) -> (UpdateMsg, Vec<Vec<UpdateMsg>>) {
    let seed = replicas[0].must(seed_op()).await;
    for r in replicas.iter().skip(1) {
        r.deliver(seed.clone()).await;
    }
    let mut streams = vec![Vec::new(); replicas.len()];
    for (i, (who, step)) in steps.iter().enumerate() {
        let replica = &mut replicas[*who];
        replica.clock.set(2_000 + i as i64);
        if let Some(msg) = replica.local(step.op()).await {
            streams[*who].push(msg);
        }
    }
    (seed, streams)
}

async fn exchange(replicas: &[TestReplica], streams: &[Vec<UpdateMsg>], choices: &[usize]) {
    for (target, replica) in replicas.iter().enumerate() {
        let others: Vec<Vec<UpdateMsg>> = streams
            .iter()
            .enumerate()
            .map(|(origin, s)| if origin == target { Vec::new() } else { s.clone() })
            .collect();
        let order = interleave(&others, choices);
        replica.deliver_all(&order).await;
        // Redelivery is a no-op.
        replica.deliver_all(&order).await;
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Concurrent modifications of one entry converge on every replica.
    #[test]
    fn test_concurrent_modifications_converge(
        steps in prop::collection::vec((0usize..3, step()), 1..14),
        choices in prop::collection::vec(0usize..3, 0..20),
    ) {
        let snapshots = runtime().block_on(async {
            let mut replicas = topology(3);
            let (_, streams) = run_locally(&mut replicas, &steps).await;
            exchange(&replicas, &streams, &choices).await;
            replicas.iter().map(TestReplica::snapshot).collect::<Vec<_>>()
        });
        for other in &snapshots[1..] {
            prop_assert_eq!(&snapshots[0], other);
        }
    }
}

#[tokio::test]
async fn test_every_delivery_order_gives_the_same_tree() {
    let mut writers = topology(3);
    let steps = vec![
        (0, Step::SetDisplayName("a")),
        (1, Step::Replace("mail", vec!["b", "c"])),
        (2, Step::Add("mail", "c")),
        (2, Step::SetDisplayName("c")),
        (0, Step::Delete("description", "b")),
    ];
    let (seed, streams) = run_locally(&mut writers, &steps).await;
    exchange(&writers, &streams, &[0, 1, 2]).await;
    let expected = writers[0].snapshot();
    assert_eq!(expected, writers[1].snapshot());
    assert_eq!(expected, writers[2].snapshot());

    let alice = writers[0].entry(&under_base("cn=alice")).unwrap();
    assert_eq!(alice.values("displayname"), ["c".to_string()]);
    assert!(alice.values("description").is_empty());

    let total: usize = streams.iter().map(Vec::len).sum();
    let permutations = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for perm in permutations {
        let observer = TestReplica::new(4);
        observer.deliver(seed.clone()).await;
        let per_origin: Vec<Vec<UpdateMsg>> = perm.iter().map(|&o| streams[o].clone()).collect();
        let order = interleave(&per_origin, &[0]);
        assert_eq!(order.len(), total);
        observer.deliver_all(&order).await;
        assert_eq!(observer.snapshot(), expected, "delivery order {perm:?}");
    }
}
