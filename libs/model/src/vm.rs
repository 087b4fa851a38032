//! VM catalog rows.

use serde::{Deserialize, Serialize};

/// One VM size at one priority, with its price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub vm_size: String,
    pub family: String,
    pub low_priority: bool,
    pub cores: u32,
    pub memory_gb: f64,
    pub disk_gb: f64,
    pub price_per_hour: f64,
}

impl VmInfo {
    pub fn is_named(&self, name: &str) -> bool {
        self.vm_size.eq_ignore_ascii_case(name)
    }

    pub fn is_in_family(&self, family: &str) -> bool {
        self.family.eq_ignore_ascii_case(family)
    }
}
