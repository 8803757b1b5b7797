//! Resource quantities, port ranges, and resource offers.
//!
//! A [`ResourceBundle`] is what a machine has (or offers): scalar
//! quantities plus a list of free port ranges. [`Resources`] is what a
//! task asks for: scalar quantities plus a number of ports that must come
//! from one contiguous range.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MachineId, OfferId, RackId};

/// Resource requirement of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpus: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    /// Ports required, allocated from a single contiguous range.
    pub num_ports: u32,
}

impl Resources {
    pub fn new(cpus: f64, memory_mb: f64) -> Self {
        Self {
            cpus,
            memory_mb,
            ..Self::default()
        }
    }

    pub fn with_disk(mut self, disk_mb: f64) -> Self {
        self.disk_mb = disk_mb;
        self
    }

    pub fn with_ports(mut self, num_ports: u32) -> Self {
        self.num_ports = num_ports;
        self
    }

    /// The first scalar that is negative or not finite, if any.
    pub fn invalid_quantity(&self) -> Option<(&'static str, f64)> {
        [
            ("cpus", self.cpus),
            ("memory_mb", self.memory_mb),
            ("disk_mb", self.disk_mb),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite() || *v < 0.0)
    }
}

/// An inclusive range of port numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    /// Number of ports in the range (0 for an inverted range).
    pub fn len(&self) -> u32 {
        if self.end < self.begin {
            0
        } else {
            u32::from(self.end - self.begin) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scalar capacity plus free port ranges on one machine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceBundle {
    pub cpus: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub ports: Vec<PortRange>,
}

impl ResourceBundle {
    pub fn new(cpus: f64, memory_mb: f64) -> Self {
        Self {
            cpus,
            memory_mb,
            ..Self::default()
        }
    }

    pub fn with_disk(mut self, disk_mb: f64) -> Self {
        self.disk_mb = disk_mb;
        self
    }

    pub fn with_ports(mut self, ports: Vec<PortRange>) -> Self {
        self.ports = ports;
        self
    }

    /// Size of the widest contiguous port range.
    pub fn widest_port_range(&self) -> u32 {
        self.ports.iter().map(PortRange::len).max().unwrap_or(0)
    }

    /// Whether `req` fits entirely inside this bundle.
    pub fn fits(&self, req: &Resources) -> bool {
        self.cpus >= req.cpus
            && self.memory_mb >= req.memory_mb
            && self.disk_mb >= req.disk_mb
            && (req.num_ports == 0 || self.widest_port_range() >= req.num_ports)
    }

    /// Carve `req` out of this bundle, returning the allocated ports.
    ///
    /// Returns `None` and leaves the bundle untouched when `req` does not fit.
    /// Ports come from the first range large enough, lowest ports first.
    pub fn take(&mut self, req: &Resources) -> Option<Vec<u16>> {
        if !self.fits(req) {
            return None;
        }

        let mut allocated = Vec::with_capacity(req.num_ports as usize);
        if req.num_ports > 0 {
            let idx = self.ports.iter().position(|r| r.len() >= req.num_ports)?;
            let range = self.ports[idx];
            let begin = u32::from(range.begin);
            let end = begin + req.num_ports;
            allocated.extend((begin..end).map(|p| p as u16));
            if range.len() == req.num_ports {
                self.ports.remove(idx);
            } else {
                // end <= range.end here, so it fits in u16.
                self.ports[idx].begin = end as u16;
            }
        }

        self.cpus -= req.cpus;
        self.memory_mb -= req.memory_mb;
        self.disk_mb -= req.disk_mb;
        Some(allocated)
    }
}

/// A single-use grant of unused capacity on one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub machine_id: MachineId,
    pub host: String,
    pub rack_id: RackId,
    pub resources: ResourceBundle,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_or_nan_quantities_are_invalid() {
        assert_eq!(Resources::new(1.0, 128.0).invalid_quantity(), None);
        assert_eq!(Resources::new(0.0, 0.0).invalid_quantity(), None);
        assert_eq!(
            Resources::new(-4.0, 128.0).invalid_quantity(),
            Some(("cpus", -4.0))
        );
        let (field, _) = Resources::new(1.0, f64::NAN).invalid_quantity().unwrap();
        assert_eq!(field, "memory_mb");
        let (field, _) = Resources::new(1.0, 1.0)
            .with_disk(f64::INFINITY)
            .invalid_quantity()
            .unwrap();
        assert_eq!(field, "disk_mb");
    }

    #[test]
    fn port_range_len_is_inclusive() {
        assert_eq!(PortRange::new(31000, 31000).len(), 1);
        assert_eq!(PortRange::new(31000, 31009).len(), 10);
        assert!(PortRange::new(10, 9).is_empty());
    }

    #[test]
    fn fits_checks_every_dimension() {
        let bundle = ResourceBundle::new(4.0, 8192.0).with_disk(100.0);

        assert!(bundle.fits(&Resources::new(4.0, 8192.0)));
        assert!(!bundle.fits(&Resources::new(4.5, 1.0)));
        assert!(!bundle.fits(&Resources::new(1.0, 9000.0)));
        assert!(!bundle.fits(&Resources::new(1.0, 1.0).with_disk(101.0)));
    }

    #[test]
    fn ports_must_come_from_one_range() {
        let bundle = ResourceBundle::new(4.0, 1024.0)
            .with_ports(vec![PortRange::new(100, 102), PortRange::new(200, 202)]);

        assert!(bundle.fits(&Resources::new(1.0, 1.0).with_ports(3)));
        // Six free ports in total, but no single range of four.
        assert!(!bundle.fits(&Resources::new(1.0, 1.0).with_ports(4)));
    }

    #[test]
    fn take_decrements_and_allocates_lowest_ports() {
        let mut bundle = ResourceBundle::new(4.0, 8192.0)
            .with_ports(vec![PortRange::new(100, 101), PortRange::new(200, 209)]);

        let ports = bundle
            .take(&Resources::new(2.0, 2048.0).with_ports(3))
            .unwrap();

        assert_eq!(ports, vec![200, 201, 202]);
        assert_eq!(bundle.cpus, 2.0);
        assert_eq!(bundle.memory_mb, 6144.0);
        assert_eq!(bundle.ports, vec![PortRange::new(100, 101), PortRange::new(203, 209)]);
    }

    #[test]
    fn take_consumes_exhausted_range() {
        let mut bundle = ResourceBundle::new(1.0, 1.0).with_ports(vec![PortRange::new(5, 6)]);
        let ports = bundle.take(&Resources::new(0.5, 0.5).with_ports(2)).unwrap();
        assert_eq!(ports, vec![5, 6]);
        assert!(bundle.ports.is_empty());
    }

    #[test]
    fn take_leaves_bundle_untouched_when_too_small() {
        let mut bundle = ResourceBundle::new(2.0, 6144.0);
        let before = bundle.clone();
        assert!(bundle.take(&Resources::new(3.0, 4096.0)).is_none());
        assert_eq!(bundle, before);
    }
}
