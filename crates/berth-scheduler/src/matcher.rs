//! Task-to-offer matching rules.

use std::fmt;

use berth_core::{EligibilitySnapshot, MachineAbstraction, Offer, PlacementConstraints, Resources, TaskRequest};

/// Why a task was not matched to an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Pinned to a different machine.
    Machine,
    /// Offer's rack is not in the allowed list.
    Rack,
    RequiredAttribute,
    AvoidedAttribute,
    /// Not enough remaining capacity on the offer.
    Resources,
    /// Another rack has fewer replicas of the request.
    RackSpread,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::Machine => "pinned to another machine",
            Rejection::Rack => "rack not allowed",
            Rejection::RequiredAttribute => "required attribute missing",
            Rejection::AvoidedAttribute => "avoided attribute present",
            Rejection::Resources => "insufficient resources",
            Rejection::RackSpread => "rack spread prefers another rack",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check the placement constraints that depend only on the offer's machine.
pub fn check_constraints(constraints: &PlacementConstraints, offer: &Offer) -> Result<(), Rejection> {
    if let Some(machine) = &constraints.machine {
        if *machine != offer.machine_id {
            return Err(Rejection::Machine);
        }
    }

    if !constraints.allowed_racks.is_empty() && !constraints.allowed_racks.contains(&offer.rack_id) {
        return Err(Rejection::Rack);
    }

    for (key, value) in &constraints.required_attributes {
        match offer.attributes.get(key) {
            Some(v) if v == value => {}
            _ => return Err(Rejection::RequiredAttribute),
        }
    }

    let avoided = constraints
        .avoided_attributes
        .iter()
        .any(|(k, v)| offer.attributes.get(k).is_some_and(|ov| ov == v));
    if avoided {
        return Err(Rejection::AvoidedAttribute);
    }

    Ok(())
}

/// Componentwise maximum of every candidate machine's advertised capacity.
///
/// A task larger than the envelope in any dimension cannot run anywhere in
/// the cluster as currently known.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CapacityEnvelope {
    pub cpus: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub widest_port_range: u32,
}

impl CapacityEnvelope {
    /// `None` when no machine has advertised its capacity yet.
    pub fn from_snapshot(snapshot: &EligibilitySnapshot) -> Option<Self> {
        let mut envelope: Option<Self> = None;
        for bundle in snapshot.capacity_candidates().filter_map(|m| m.resources.as_ref()) {
            let e = envelope.get_or_insert_with(Self::default);
            e.cpus = e.cpus.max(bundle.cpus);
            e.memory_mb = e.memory_mb.max(bundle.memory_mb);
            e.disk_mb = e.disk_mb.max(bundle.disk_mb);
            e.widest_port_range = e.widest_port_range.max(bundle.widest_port_range());
        }
        envelope
    }

    pub fn could_fit(&self, req: &Resources) -> bool {
        self.cpus >= req.cpus
            && self.memory_mb >= req.memory_mb
            && self.disk_mb >= req.disk_mb
            && self.widest_port_range >= req.num_ports
    }
}

/// Why a task can never be placed, if that is already known.
pub fn impossible_reason(
    task: &TaskRequest,
    envelope: Option<&CapacityEnvelope>,
    snapshot: &EligibilitySnapshot,
) -> Option<String> {
    if let Some(pinned) = &task.constraints.machine {
        if let Some(machine) = snapshot.machine(pinned) {
            let state = machine.state();
            if state.is_decommissioning() || state.is_terminal() {
                return Some(format!("pinned machine {pinned} is {state}"));
            }
            if let Some(bundle) = &machine.resources {
                if !bundle.fits(&task.resources) {
                    return Some(format!("exceeds capacity of pinned machine {pinned}"));
                }
            }
        }
    }

    let envelope = envelope?;
    if !envelope.could_fit(&task.resources) {
        let r = &task.resources;
        return Some(format!(
            "requires cpus={} memory_mb={} disk_mb={} ports={}, largest machine offers cpus={} memory_mb={} disk_mb={} ports={}",
            r.cpus,
            r.memory_mb,
            r.disk_mb,
            r.num_ports,
            envelope.cpus,
            envelope.memory_mb,
            envelope.disk_mb,
            envelope.widest_port_range
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use berth_core::{Machine, MachineState, PortRange, ResourceBundle, StateHistoryUpdate};

    fn offer(machine: &str, rack: &str, attrs: &[(&str, &str)]) -> Offer {
        Offer {
            id: format!("o-{machine}"),
            machine_id: machine.to_string(),
            host: format!("{machine}.example"),
            rack_id: rack.to_string(),
            resources: ResourceBundle::new(4.0, 8192.0),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn required_attributes_must_all_match() {
        let c = PlacementConstraints {
            required_attributes: attrs(&[("zone", "a"), ("disk", "ssd")]),
            ..Default::default()
        };

        assert_eq!(check_constraints(&c, &offer("m1", "r1", &[("zone", "a"), ("disk", "ssd")])), Ok(()));
        assert_eq!(
            check_constraints(&c, &offer("m1", "r1", &[("zone", "a"), ("disk", "hdd")])),
            Err(Rejection::RequiredAttribute)
        );
        assert_eq!(
            check_constraints(&c, &offer("m1", "r1", &[("zone", "a")])),
            Err(Rejection::RequiredAttribute)
        );
    }

    #[test]
    fn avoided_attributes_must_not_match() {
        let c = PlacementConstraints {
            avoided_attributes: attrs(&[("gpu", "none")]),
            ..Default::default()
        };

        assert_eq!(check_constraints(&c, &offer("m1", "r1", &[("gpu", "a100")])), Ok(()));
        assert_eq!(check_constraints(&c, &offer("m1", "r1", &[])), Ok(()));
        assert_eq!(
            check_constraints(&c, &offer("m1", "r1", &[("gpu", "none")])),
            Err(Rejection::AvoidedAttribute)
        );
    }

    #[test]
    fn rack_and_machine_affinity() {
        let racks = PlacementConstraints {
            allowed_racks: vec!["r2".to_string()],
            ..Default::default()
        };
        assert_eq!(check_constraints(&racks, &offer("m1", "r1", &[])), Err(Rejection::Rack));
        assert_eq!(check_constraints(&racks, &offer("m1", "r2", &[])), Ok(()));

        let pinned = PlacementConstraints {
            machine: Some("m7".to_string()),
            ..Default::default()
        };
        assert_eq!(check_constraints(&pinned, &offer("m1", "r1", &[])), Err(Rejection::Machine));
        assert_eq!(check_constraints(&pinned, &offer("m7", "r1", &[])), Ok(()));
    }

    fn snapshot(machines: Vec<(&str, MachineState, Option<ResourceBundle>)>) -> EligibilitySnapshot {
        EligibilitySnapshot::new(
            1,
            machines.into_iter().map(|(id, state, res)| {
                Machine::new(id, "h", "r1", BTreeMap::new(), res, MachineState::Active, 0)
                    .with_state(StateHistoryUpdate::new(id, state, 1))
            }),
        )
    }

    #[test]
    fn envelope_is_componentwise_max() {
        let snap = snapshot(vec![
            ("m1", MachineState::Active, Some(ResourceBundle::new(16.0, 4096.0))),
            (
                "m2",
                MachineState::Active,
                Some(
                    ResourceBundle::new(4.0, 65536.0)
                        .with_ports(vec![PortRange::new(31000, 31099)]),
                ),
            ),
            ("m3", MachineState::Decommissioning, Some(ResourceBundle::new(64.0, 1.0))),
        ]);

        let env = CapacityEnvelope::from_snapshot(&snap).unwrap();
        assert_eq!(env.cpus, 16.0);
        assert_eq!(env.memory_mb, 65536.0);
        assert_eq!(env.widest_port_range, 100);

        // Fits the envelope even though no single machine has both.
        assert!(env.could_fit(&Resources::new(12.0, 30000.0)));
        assert!(!env.could_fit(&Resources::new(32.0, 1.0)));
        assert!(!env.could_fit(&Resources::new(1.0, 1.0).with_ports(101)));
    }

    #[test]
    fn no_capacity_known_means_no_envelope() {
        let snap = snapshot(vec![("m1", MachineState::Active, None)]);
        assert!(CapacityEnvelope::from_snapshot(&snap).is_none());
    }

    #[test]
    fn pinned_to_leaving_machine_is_impossible() {
        let snap = snapshot(vec![(
            "m1",
            MachineState::Decommissioning,
            Some(ResourceBundle::new(8.0, 8192.0)),
        )]);
        let task = TaskRequest {
            task_id: "t".to_string(),
            request_id: "r".to_string(),
            resources: Resources::new(1.0, 1.0),
            constraints: PlacementConstraints {
                machine: Some("m1".to_string()),
                ..Default::default()
            },
            priority: 0,
            image: "busybox".to_string(),
            env: vec![],
        };

        let reason = impossible_reason(&task, None, &snap).unwrap();
        assert!(reason.contains("DECOMMISSIONING"));
    }
}
