use abd::{
    InMemoryNetwork, InMemoryTransport, Label, Majority, Message, OperationId, ProcessId, Register,
    RegisterOptions, Transport, View, quorum_size,
};
use proptest::prelude::*;
use proptest::strategy::Union;
use proptest::test_runner::{Config, TestCaseError};
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Runtime;

const REPLICAS: usize = 5;
const GROUP: &str = "model";

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn pid(index: usize) -> ProcessId {
    ProcessId::from_node_id(index as u16 + 1)
}

proptest! {
    #[test]
    fn quorums_of_one_view_intersect(size in 1u16..=50, seed in any::<u64>()) {
        let view = View::new(1, (1..=size).map(ProcessId::from_node_id));
        let majority = Majority::new(&view);
        let mut rng = StdRng::seed_from_u64(seed);

        for _ in 0..20 {
            let a: BTreeSet<ProcessId> = majority.pick_quorum(&mut rng).into_iter().collect();
            let b: BTreeSet<ProcessId> = majority.pick_quorum(&mut rng).into_iter().collect();
            prop_assert_eq!(a.len(), quorum_size(size as usize));
            prop_assert_eq!(b.len(), quorum_size(size as usize));
            prop_assert!(a.intersection(&b).next().is_some());
        }
    }
}

proptest! {
    #![proptest_config(Config {
        cases: 64,
        .. Config::default()
    })]

    /// However write requests are ordered, a replica only ever moves to a
    /// higher label and keeps the value that came with it.
    #[test]
    fn replica_label_never_decreases(labels in prop::collection::vec(1u64..20, 1..30)) {
        let rt = runtime();
        rt.block_on(async {
            let network = InMemoryNetwork::<u64>::new();
            let transport = Arc::new(network.endpoint(pid(0)));
            let replica = Register::init("monotone", transport, RegisterOptions::read_only())
                .await
                .unwrap();

            let peer = network.endpoint(pid(1));
            let mut membership = peer.join("monotone").await.unwrap();

            let mut max = Label::ZERO;
            for (i, label) in labels.iter().enumerate() {
                let operation = OperationId(i as u64);
                peer.send(
                    pid(0),
                    Message::write_request(operation, Some(*label * 10), Label(*label)),
                )
                .await
                .unwrap();

                let ack = membership.inbox.recv().await.unwrap();
                prop_assert_eq!(ack.message, Message::write_reply(operation));

                max = max.max(Label(*label));
                let (value, current) = replica.snapshot().await;
                prop_assert_eq!(current, max);
                prop_assert_eq!(value, Some(max.value() * 10));
            }

            replica.close().await.unwrap();
            Ok::<(), TestCaseError>(())
        })?;
    }
}

/// Sequential model of an atomic register: the last completed write wins
#[derive(Clone, Debug)]
struct RegisterModel {
    latest: Option<u32>,
    crashed: BTreeSet<usize>,
}

/// Replica 0 is the single writer and never crashes
#[derive(Clone, Debug)]
enum Step {
    Write(u32),
    Read(usize),
    Crash(usize),
}

impl ReferenceStateMachine for RegisterModel {
    type State = Self;
    type Transition = Step;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(RegisterModel {
            latest: None,
            crashed: BTreeSet::new(),
        })
        .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let live: Vec<usize> = (0..REPLICAS)
            .filter(|i| !state.crashed.contains(i))
            .collect();
        let crashable: Vec<usize> = live.iter().copied().filter(|i| *i != 0).collect();

        let mut steps = vec![
            (3, any::<u32>().prop_map(Step::Write).boxed()),
            (4, prop::sample::select(live).prop_map(Step::Read).boxed()),
        ];
        // one crash of five keeps every later quorum intersecting earlier ones
        if state.crashed.is_empty() && !crashable.is_empty() {
            steps.push((1, prop::sample::select(crashable).prop_map(Step::Crash).boxed()));
        }
        Union::new_weighted(steps).boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Step::Write(value) => state.latest = Some(*value),
            Step::Read(_) => {}
            Step::Crash(index) => {
                state.crashed.insert(*index);
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            Step::Write(_) => true,
            Step::Read(index) => *index < REPLICAS && !state.crashed.contains(index),
            Step::Crash(index) => *index != 0 && *index < REPLICAS && state.crashed.is_empty(),
        }
    }
}

/// Five replicas on an in-memory network, driven from a private runtime
struct Cluster {
    registers: Vec<Register<u32, InMemoryTransport<u32>>>,
    network: InMemoryNetwork<u32>,
    last_label: Label,
    rt: Runtime,
}

impl StateMachineTest for Cluster {
    type SystemUnderTest = Self;
    type Reference = RegisterModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let rt = runtime();
        let network = InMemoryNetwork::new();
        let registers = rt.block_on(async {
            let mut registers = Vec::new();
            for index in 0..REPLICAS {
                let transport = Arc::new(network.endpoint(pid(index)));
                let options = if index == 0 {
                    RegisterOptions::writable()
                } else {
                    RegisterOptions::read_only()
                };
                registers.push(Register::init(GROUP, transport, options).await.unwrap());
            }
            registers
        });

        Cluster {
            registers,
            network,
            last_label: Label::ZERO,
            rt,
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        match transition {
            Step::Write(value) => {
                let label = state
                    .rt
                    .block_on(state.registers[0].write(value))
                    .unwrap();
                assert!(label > state.last_label);
                state.last_label = label;
            }
            Step::Read(index) => {
                let (value, label) = state
                    .rt
                    .block_on(state.registers[index].read_labeled())
                    .unwrap();
                assert_eq!(value, ref_state.latest);
                assert_eq!(label, state.last_label);
            }
            Step::Crash(index) => {
                let crashed = state.rt.block_on(state.network.crash(GROUP, pid(index)));
                assert!(crashed);
            }
        }
        state
    }
}

prop_state_machine! {
    #![proptest_config(Config {
        cases: 32,
        .. Config::default()
    })]

    #[test]
    fn register_is_linearizable(
        sequential
        1..40
        =>
        Cluster
    );
}
