//! Logical device mesh
//!
//! Devices are arranged on named axes (`data`, `model`, ...). A device's
//! coordinate on an axis decides which block of a sharded parameter it
//! holds; devices that differ only on other axes hold identical blocks.
//!
//! ```text
//! mesh: data=2, model=2
//!
//!            model=0   model=1
//! data=0   ┌─────────┬─────────┐
//!          │ dev 0   │ dev 1   │
//! data=1   ├─────────┼─────────┤
//!          │ dev 2   │ dev 3   │
//!          └─────────┴─────────┘
//! ```

mod capabilities;

pub use capabilities::DeviceCapabilities;

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    /// Host-simulated device
    Virtual,
}

/// A single device in the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id, unique within the mesh
    pub id: u32,
    pub kind: DeviceKind,
    /// Memory budget in bytes (0 = unknown)
    pub memory_bytes: u64,
}

impl Device {
    pub fn virtual_device(id: u32, memory_bytes: u64) -> Self {
        Self {
            id,
            kind: DeviceKind::Virtual,
            memory_bytes,
        }
    }
}

/// A named mesh axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshAxis {
    pub name: String,
    pub size: usize,
}

impl MeshAxis {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// Devices arranged on named axes, row-major (last axis varies fastest)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMesh {
    devices: Vec<Device>,
    axes: Vec<MeshAxis>,
}

impl DeviceMesh {
    /// Create a mesh, validating axes against the device list
    pub fn new(devices: Vec<Device>, axes: Vec<MeshAxis>) -> Result<Self> {
        if devices.is_empty() {
            return Err(EngineError::Sharding("Mesh needs at least one device".to_string()));
        }
        if axes.is_empty() {
            return Err(EngineError::Sharding("Mesh needs at least one axis".to_string()));
        }

        let mut names = HashSet::new();
        for axis in &axes {
            if axis.size == 0 {
                return Err(EngineError::Sharding(format!(
                    "Mesh axis '{}' has size 0",
                    axis.name
                )));
            }
            if !names.insert(axis.name.as_str()) {
                return Err(EngineError::Sharding(format!(
                    "Duplicate mesh axis '{}'",
                    axis.name
                )));
            }
        }

        let product: usize = axes.iter().map(|a| a.size).product();
        if product != devices.len() {
            return Err(EngineError::Sharding(format!(
                "Mesh axes multiply to {} but {} devices were given",
                product,
                devices.len()
            )));
        }

        let mut ids = HashSet::new();
        if !devices.iter().all(|d| ids.insert(d.id)) {
            return Err(EngineError::Sharding("Duplicate device id in mesh".to_string()));
        }

        Ok(Self { devices, axes })
    }

    /// One-axis mesh of `n` virtual devices
    pub fn linear(n: usize, axis: &str) -> Result<Self> {
        let devices = (0..n).map(|i| Device::virtual_device(i as u32, 0)).collect();
        Self::new(devices, vec![MeshAxis::new(axis, n)])
    }

    /// Virtual devices on this host, splitting its memory evenly
    pub fn virtual_host(axes: Vec<MeshAxis>, caps: &DeviceCapabilities) -> Result<Self> {
        let n: usize = axes.iter().map(|a| a.size).product();
        let per_device = caps.ram_bytes / n.max(1) as u64;
        let devices = (0..n)
            .map(|i| Device::virtual_device(i as u32, per_device))
            .collect();
        Self::new(devices, axes)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Position of a named axis
    pub fn axis_index(&self, name: &str) -> Result<usize> {
        self.axes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| EngineError::Sharding(format!("Unknown mesh axis '{}'", name)))
    }

    /// Size of a named axis
    pub fn axis_size(&self, name: &str) -> Result<usize> {
        Ok(self.axes[self.axis_index(name)?].size)
    }

    /// Coordinates of the device at `device_idx`, one per axis
    pub fn coords(&self, device_idx: usize) -> Vec<usize> {
        let mut coords = vec![0; self.axes.len()];
        let mut rem = device_idx;
        for (i, axis) in self.axes.iter().enumerate().rev() {
            coords[i] = rem % axis.size;
            rem /= axis.size;
        }
        coords
    }

    /// Devices that together hold one copy of a parameter split over `axis`
    ///
    /// These are the devices at coordinate 0 on every other axis, ordered
    /// by their coordinate on `axis`.
    pub fn replica_group(&self, axis: &str) -> Result<Vec<usize>> {
        let axis_idx = self.axis_index(axis)?;
        let group = (0..self.devices.len())
            .filter(|&d| {
                self.coords(d)
                    .iter()
                    .enumerate()
                    .all(|(i, &c)| i == axis_idx || c == 0)
            })
            .collect();
        Ok(group)
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes: Vec<String> = self
            .axes
            .iter()
            .map(|a| format!("{}={}", a.name, a.size))
            .collect();
        write!(f, "{}", axes.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh_2x2() -> DeviceMesh {
        let devices = (0..4).map(|i| Device::virtual_device(i, 0)).collect();
        DeviceMesh::new(
            devices,
            vec![MeshAxis::new("data", 2), MeshAxis::new("model", 2)],
        )
        .unwrap()
    }

    #[test]
    fn test_linear_mesh() {
        let mesh = DeviceMesh::linear(4, "data").unwrap();
        assert_eq!(mesh.len(), 4);
        assert_eq!(mesh.axis_size("data").unwrap(), 4);
        assert_eq!(mesh.coords(3), vec![3]);
        assert_eq!(mesh.to_string(), "data=4");
    }

    #[test]
    fn test_mesh_validation() {
        let devices: Vec<Device> = (0..3).map(|i| Device::virtual_device(i, 0)).collect();
        assert!(DeviceMesh::new(devices.clone(), vec![MeshAxis::new("data", 2)]).is_err());
        assert!(DeviceMesh::new(vec![], vec![MeshAxis::new("data", 1)]).is_err());
        assert!(DeviceMesh::new(devices.clone(), vec![]).is_err());
        assert!(DeviceMesh::new(
            devices[..1].to_vec(),
            vec![MeshAxis::new("a", 1), MeshAxis::new("a", 1)]
        )
        .is_err());

        let dup_ids = vec![Device::virtual_device(0, 0), Device::virtual_device(0, 0)];
        assert!(DeviceMesh::new(dup_ids, vec![MeshAxis::new("data", 2)]).is_err());
    }

    #[test]
    fn test_coords_row_major() {
        let mesh = mesh_2x2();
        assert_eq!(mesh.coords(0), vec![0, 0]);
        assert_eq!(mesh.coords(1), vec![0, 1]);
        assert_eq!(mesh.coords(2), vec![1, 0]);
        assert_eq!(mesh.coords(3), vec![1, 1]);
    }

    #[test]
    fn test_replica_group() {
        let mesh = mesh_2x2();
        assert_eq!(mesh.replica_group("data").unwrap(), vec![0, 2]);
        assert_eq!(mesh.replica_group("model").unwrap(), vec![0, 1]);
        assert!(mesh.replica_group("pipeline").is_err());
    }

    #[test]
    fn test_virtual_host_splits_memory() {
        let caps = DeviceCapabilities {
            cpu_cores: 4,
            ram_bytes: 8_000,
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
        };
        let mesh = DeviceMesh::virtual_host(vec![MeshAxis::new("data", 4)], &caps).unwrap();
        assert!(mesh.devices().iter().all(|d| d.memory_bytes == 2_000));
        assert!(mesh.devices().iter().all(|d| d.kind == DeviceKind::Virtual));
    }
}
