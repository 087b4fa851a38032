//! VM size selection.
//!
//! Picks the cheapest catalog entry that satisfies a task's requirement,
//! honoring allow-lists, the exclusion set and the low-priority fallback.

use tesbatch_model::{ResourceRequirement, VmInfo, Warning};
use tesbatch_reconcile::ExclusionSet;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;

/// The chosen VM and any warning that came with choosing it.
#[derive(Debug, Clone, PartialEq)]
pub struct VmSelection {
    pub vm: VmInfo,
    pub warning: Option<Warning>,
}

/// Selection settings shared by all tasks.
#[derive(Debug, Clone, Copy)]
pub struct VmSelector<'a> {
    allowed_vm_sizes: &'a [String],
    use_preemptible_vms_only: bool,
    fallback_ratio: f64,
}

impl<'a> VmSelector<'a> {
    pub fn new(config: &'a SchedulerConfig) -> Self {
        Self {
            allowed_vm_sizes: &config.allowed_vm_sizes,
            use_preemptible_vms_only: config.use_preemptible_vms_only,
            fallback_ratio: config.low_priority_fallback_ratio,
        }
    }

    /// Selects a VM for `requirement`. `Ok(None)` means nothing in the
    /// catalog qualifies.
    pub fn select(
        &self,
        requirement: &ResourceRequirement,
        catalog: &[VmInfo],
        excluded: &ExclusionSet,
    ) -> SchedulerResult<Option<VmSelection>> {
        requirement.validate()?;

        let low_priority = requirement.preemptible || self.use_preemptible_vms_only;
        let Some(selected) = self.cheapest(requirement, catalog, excluded, low_priority) else {
            debug!(
                low_priority,
                catalog_size = catalog.len(),
                excluded = excluded.len(),
                "No VM size qualifies"
            );
            return Ok(None);
        };

        if !low_priority {
            if let Some(cheaper) = self.cheapest(requirement, catalog, excluded, true) {
                if selected.price_per_hour > self.fallback_ratio * cheaper.price_per_hour {
                    debug!(
                        dedicated = %selected.vm_size,
                        low_priority = %cheaper.vm_size,
                        "Using low priority VM instead of dedicated"
                    );
                    return Ok(Some(VmSelection {
                        vm: cheaper.clone(),
                        warning: Some(Warning::UsedLowPriorityInsteadOfDedicatedVm),
                    }));
                }
            }
        }

        Ok(Some(VmSelection {
            vm: selected.clone(),
            warning: None,
        }))
    }

    /// Catalog entries in one category that satisfy the requirement.
    pub fn candidates<'c>(
        &'c self,
        requirement: &'c ResourceRequirement,
        catalog: &'c [VmInfo],
        excluded: &'c ExclusionSet,
        low_priority: bool,
    ) -> impl Iterator<Item = &'c VmInfo> + 'c {
        catalog
            .iter()
            .filter(move |vm| vm.low_priority == low_priority)
            .filter(move |vm| match &requirement.vm_size {
                Some(size) => vm.is_named(size),
                None => {
                    vm.cores >= requirement.cpu_cores
                        && vm.memory_gb >= requirement.ram_gb
                        && vm.disk_gb >= requirement.disk_gb
                }
            })
            .filter(move |vm| is_allowed(vm, self.allowed_vm_sizes))
            .filter(move |vm| {
                requirement
                    .allowed_vm_sizes
                    .as_deref()
                    .is_none_or(|list| is_allowed(vm, list))
            })
            .filter(move |vm| !excluded.contains(&vm.vm_size))
    }

    /// Ties go to the entry listed first.
    fn cheapest<'c>(
        &'c self,
        requirement: &'c ResourceRequirement,
        catalog: &'c [VmInfo],
        excluded: &'c ExclusionSet,
        low_priority: bool,
    ) -> Option<&'c VmInfo> {
        self.candidates(requirement, catalog, excluded, low_priority)
            .min_by(|a, b| a.price_per_hour.total_cmp(&b.price_per_hour))
    }
}

/// An empty list allows everything.
fn is_allowed(vm: &VmInfo, allowed: &[String]) -> bool {
    allowed.is_empty()
        || allowed
            .iter()
            .any(|entry| vm.is_named(entry) || vm.is_in_family(entry))
}

/// System log detail for a task no VM can serve.
pub fn no_vm_available_detail(
    requirement: &ResourceRequirement,
    catalog_size: usize,
    excluded: &ExclusionSet,
) -> String {
    let wanted = match &requirement.vm_size {
        Some(size) => format!("VM size {size}"),
        None => format!(
            "{} cores, {} GB memory, {} GB disk",
            requirement.cpu_cores, requirement.ram_gb, requirement.disk_gb
        ),
    };
    let mut detail = format!(
        "No VM (out of {catalog_size}) available with the required resources \
         ({wanted}, preemptible: {})",
        requirement.preemptible
    );
    if !excluded.is_empty() {
        let sizes: Vec<&str> = excluded.iter().collect();
        detail.push_str(&format!(". Excluded VM sizes: {}", sizes.join(", ")));
    }
    detail
}
