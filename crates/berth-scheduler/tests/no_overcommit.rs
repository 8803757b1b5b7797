//! Randomized rounds: whatever is submitted and offered, assignments never
//! exceed what their offer had.

use std::collections::{BTreeMap, HashMap, HashSet};

use proptest::prelude::*;

use berth_core::{
    EligibilitySnapshot, Machine, MachineState, Offer, PlacementConstraints, PortRange,
    ResourceBundle, Resources, SchedulerConfig, TaskRequest,
};
use berth_scheduler::Scheduler;

const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone)]
struct TaskInput {
    cpus: f64,
    memory_mb: f64,
    disk_mb: f64,
    num_ports: u32,
    priority: i32,
    spread: bool,
}

#[derive(Debug, Clone)]
struct OfferInput {
    machine: usize,
    cpus: f64,
    memory_mb: f64,
    disk_mb: f64,
    port_ranges: Vec<(u16, u16)>,
}

fn task_input() -> impl Strategy<Value = TaskInput> {
    (
        -4.0f64..8.0,
        prop_oneof![Just(f64::NAN), -1024.0f64..8192.0],
        0.0f64..2000.0,
        0u32..6,
        -2i32..3,
        any::<bool>(),
    )
        .prop_map(|(cpus, memory_mb, disk_mb, num_ports, priority, spread)| TaskInput {
            cpus,
            memory_mb,
            disk_mb,
            num_ports,
            priority,
            spread,
        })
}

fn offer_input() -> impl Strategy<Value = OfferInput> {
    (
        0usize..4,
        0.0f64..16.0,
        0.0f64..16384.0,
        0.0f64..4000.0,
        prop::collection::vec((31000u16..31100, 0u16..8), 0..3),
    )
        .prop_map(|(machine, cpus, memory_mb, disk_mb, starts)| OfferInput {
            machine,
            cpus,
            memory_mb,
            disk_mb,
            // Disjoint ranges: each one sits in its own block of 1000 ports.
            port_ranges: starts
                .into_iter()
                .enumerate()
                .map(|(i, (begin, len))| {
                    let begin = begin + 1000 * i as u16;
                    (begin, begin + len)
                })
                .collect(),
        })
}

fn snapshot() -> EligibilitySnapshot {
    EligibilitySnapshot::new(
        1,
        (0..4).map(|i| {
            Machine::new(
                format!("m{i}"),
                format!("m{i}.example"),
                format!("r{}", i % 2),
                BTreeMap::new(),
                Some(ResourceBundle::new(16.0, 16384.0).with_disk(4000.0)),
                MachineState::Active,
                0,
            )
        }),
    )
}

fn build_offer(round: usize, idx: usize, input: &OfferInput) -> Offer {
    Offer {
        id: format!("o{round}-{idx}"),
        machine_id: format!("m{}", input.machine),
        host: format!("m{}.example", input.machine),
        rack_id: format!("r{}", input.machine % 2),
        resources: ResourceBundle::new(input.cpus, input.memory_mb)
            .with_disk(input.disk_mb)
            .with_ports(
                input
                    .port_ranges
                    .iter()
                    .map(|&(begin, end)| PortRange::new(begin, end))
                    .collect(),
            ),
        attributes: BTreeMap::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn assignments_never_exceed_their_offer(
        tasks in prop::collection::vec(task_input(), 0..16),
        rounds in prop::collection::vec(prop::collection::vec(offer_input(), 1..4), 1..4),
    ) {
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        for (i, t) in tasks.iter().enumerate() {
            let request = TaskRequest {
                task_id: format!("t{i}"),
                request_id: format!("req{}", i % 3),
                resources: Resources::new(t.cpus, t.memory_mb)
                    .with_disk(t.disk_mb)
                    .with_ports(t.num_ports),
                constraints: PlacementConstraints {
                    spread_across_racks: t.spread,
                    ..PlacementConstraints::default()
                },
                priority: t.priority,
                image: "busybox".to_string(),
                env: Vec::new(),
            };
            // Invalid quantities are refused here and never reach a round.
            let _ = scheduler.submit(request, i as u64);
        }

        let snap = snapshot();
        for (round, inputs) in rounds.iter().enumerate() {
            let offers: Vec<Offer> = inputs
                .iter()
                .enumerate()
                .map(|(idx, input)| build_offer(round, idx, input))
                .collect();
            let by_id: HashMap<String, Offer> =
                offers.iter().map(|o| (o.id.clone(), o.clone())).collect();

            let outcome = scheduler.run_round(offers, &snap, 1_000 + round as u64);

            for accepted in &outcome.accepted {
                let offer = &by_id[&accepted.offer_id];
                let mut cpus = 0.0;
                let mut memory = 0.0;
                let mut disk = 0.0;
                let mut ports = HashSet::new();
                for a in &accepted.assignments {
                    let req = a.task.resources;
                    prop_assert!(req.cpus >= 0.0 && req.memory_mb >= 0.0 && req.disk_mb >= 0.0);
                    cpus += req.cpus;
                    memory += req.memory_mb;
                    disk += req.disk_mb;

                    prop_assert_eq!(a.ports.len(), req.num_ports as usize);
                    for port in &a.ports {
                        prop_assert!(
                            offer.resources.ports.iter().any(|r| r.begin <= *port && *port <= r.end),
                            "port {} outside offer {}", port, offer.id
                        );
                        prop_assert!(ports.insert(*port), "port {} assigned twice", port);
                    }
                }
                prop_assert!(cpus <= offer.resources.cpus + EPSILON,
                    "cpus {} > {} on {}", cpus, offer.resources.cpus, offer.id);
                prop_assert!(memory <= offer.resources.memory_mb + EPSILON,
                    "memory {} > {} on {}", memory, offer.resources.memory_mb, offer.id);
                prop_assert!(disk <= offer.resources.disk_mb + EPSILON,
                    "disk {} > {} on {}", disk, offer.resources.disk_mb, offer.id);
            }
        }
    }
}
