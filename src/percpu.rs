use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::caps::{
    cr_is_invalid, EptInfo, VmxBasicInfo, VmxMiscInfo, CR4_VMXE, FEATURE_CONTROL_LOCK,
    FEATURE_CONTROL_VMXON, MSR_IA32_FEATURE_CONTROL, MSR_IA32_VMX_CR0_FIXED0,
    MSR_IA32_VMX_CR0_FIXED1, MSR_IA32_VMX_CR4_FIXED0, MSR_IA32_VMX_CR4_FIXED1,
};
use crate::hal::AxVmxHal;
use crate::region::VmxRegion;

/// Shared state of one machine-wide activation attempt.
///
/// Every targeted CPU ORs its bit into `active_mask` on success. The mask is only
/// read after [`AxVmxHal::exec_on_cpus`] has returned, so the blocking contract of
/// the cross-CPU primitive is the sole synchronization between the writers and the
/// reader; no partial mask is ever observed.
pub(crate) struct ActivationContext<'a, H: AxVmxHal> {
    regions: &'a [VmxRegion<H>],
    active_mask: AtomicUsize,
}

impl<'a, H: AxVmxHal> ActivationContext<'a, H> {
    pub(crate) fn new(regions: &'a [VmxRegion<H>]) -> Self {
        Self {
            regions,
            active_mask: AtomicUsize::new(0),
        }
    }

    /// The accumulated mask of CPUs that entered VMX operation. Only meaningful
    /// after the cross-CPU primitive has returned.
    pub(crate) fn active_mask(&self) -> usize {
        self.active_mask.load(Ordering::SeqCst)
    }
}

/// Checks VMX capabilities and enters VMX root operation on the current CPU.
///
/// Runs on each targeted CPU via [`AxVmxHal::exec_on_cpus`]. Every step aborts the
/// whole routine on failure, leaving this CPU's bit unset in the shared mask; that
/// absent bit is the only failure report the coordinator needs, since any single
/// CPU failing invalidates the whole activation.
pub(crate) fn activate_current_cpu<H: AxVmxHal>(ctx: &ActivationContext<H>) {
    let cpu_id = H::current_cpu_id();
    let region = &ctx.regions[cpu_id];

    // Check that we have instruction information when we VM exit on I/O, and that
    // the full VMX controls are available.
    let vmx_info = VmxBasicInfo::read::<H>();
    if !vmx_info.io_exit_info || !vmx_info.vmx_controls {
        return;
    }

    // Check that a page-walk length of 4, write-back memory, accessed/dirty flags
    // and the INVEPT instruction are supported for EPT.
    let ept_info = EptInfo::read::<H>();
    if !ept_info.page_walk_4 || !ept_info.write_back || !ept_info.ept_flags || !ept_info.invept {
        return;
    }

    // Check that wait-for-SIPI is a supported activity state.
    let misc_info = VmxMiscInfo::read::<H>();
    if !misc_info.wait_for_sipi {
        return;
    }

    // Enable VMXON in IA32_FEATURE_CONTROL, if firmware has not done so already.
    // If the MSR is locked with VMXON disabled, BIOS has disabled VMX and nothing
    // at runtime can re-enable it.
    let feature_control = H::read_msr(MSR_IA32_FEATURE_CONTROL);
    if feature_control & FEATURE_CONTROL_LOCK == 0 {
        H::write_msr(
            MSR_IA32_FEATURE_CONTROL,
            feature_control | FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMXON,
        );
    } else if feature_control & FEATURE_CONTROL_VMXON == 0 {
        return;
    }

    // Check the control registers are in a VMX-friendly state.
    let cr0 = H::read_cr0();
    if cr_is_invalid(
        cr0,
        H::read_msr(MSR_IA32_VMX_CR0_FIXED0),
        H::read_msr(MSR_IA32_VMX_CR0_FIXED1),
    ) {
        return;
    }
    let cr4 = H::read_cr4() | CR4_VMXE;
    if cr_is_invalid(
        cr4,
        H::read_msr(MSR_IA32_VMX_CR4_FIXED0),
        H::read_msr(MSR_IA32_VMX_CR4_FIXED1),
    ) {
        return;
    }

    // Enable VMX using the VMXE bit.
    H::write_cr4(cr4);

    // Set up the VMXON region and enter VMX root operation.
    region.set_revision_id(vmx_info.revision_id);
    if !H::vmxon(region.physical_address()) {
        warn!("Failed to turn on VMX on CPU {}", cpu_id);
        return;
    }

    ctx.active_mask.fetch_or(1 << cpu_id, Ordering::SeqCst);
}

/// Leaves VMX root operation on the current CPU.
///
/// Best-effort teardown: CR4.VMXE is cleared whether or not VMXOFF succeeded, and
/// no result is reported back.
pub(crate) fn deactivate_current_cpu<H: AxVmxHal>() {
    if !H::vmxoff() {
        warn!("Failed to turn off VMX on CPU {}", H::current_cpu_id());
    }
    H::write_cr4(H::read_cr4() & !CR4_VMXE);
}
