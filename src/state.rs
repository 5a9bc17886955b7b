use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use log::debug;

use crate::caps::VmxBasicInfo;
use crate::hal::{AxVmxHal, CPU_MASK_ALL};
use crate::percpu::{activate_current_cpu, deactivate_current_cpu, ActivationContext};
use crate::region::VmxRegion;

/// Number of allocatable VPIDs. VPID values range over `1..=NUM_VPIDS`; 0 is
/// reserved to tag the host's TLB entries and is never handed out.
pub const NUM_VPIDS: usize = 64;

const WORD_BITS: usize = u64::BITS as usize;
const VPID_WORDS: usize = NUM_VPIDS.div_ceil(WORD_BITS);

/// Fixed-capacity bitmap backing the VPID allocator. Bit `n` set means VPID `n + 1`
/// is in use.
pub(crate) struct VpidBitmap {
    words: [u64; VPID_WORDS],
}

impl VpidBitmap {
    pub(crate) const fn new() -> Self {
        Self {
            words: [0; VPID_WORDS],
        }
    }

    /// Index of the lowest clear bit, or `None` if all bits are set.
    pub(crate) fn first_unset(&self) -> Option<usize> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let index = i * WORD_BITS + word.trailing_ones() as usize;
                if index < NUM_VPIDS {
                    return Some(index);
                }
            }
        }
        None
    }

    pub(crate) fn get(&self, index: usize) -> bool {
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    pub(crate) fn set(&mut self, index: usize) {
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    pub(crate) fn clear(&mut self, index: usize) {
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }
}

/// Machine-wide VMX state: one VMXON region per possible CPU, plus the VPID
/// allocator.
///
/// Exists exactly while the machine is actively virtualizing. [`VmxCpuState::new`]
/// only returns a value once every online CPU has entered VMX root operation;
/// dropping it leaves VMX root operation on every CPU. A vCPU may migrate to any
/// online CPU, so a machine with only some CPUs activated is unusable and strictly
/// worse than reporting `Unsupported`.
pub struct VmxCpuState<H: AxVmxHal> {
    regions: Vec<VmxRegion<H>>,
    vpid_bitmap: VpidBitmap,
}

impl<H: AxVmxHal> VmxCpuState<H> {
    /// Allocates a VMXON region for every possible CPU and enters VMX root
    /// operation on every online CPU, all-or-nothing.
    ///
    /// # Errors
    ///
    /// * `Unsupported` - a VMX capability is missing, or at least one online CPU
    ///   failed to activate. Every CPU that did activate is deactivated again
    ///   before this is returned.
    /// * `NoMemory` - allocating a VMXON region failed. Already-allocated regions
    ///   are freed by ownership release.
    pub fn new() -> AxResult<Self> {
        let num_cpus = H::max_cpu_num();
        let vmx_info = VmxBasicInfo::read::<H>();
        let mut regions = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            let mut region = VmxRegion::new_uninit();
            region.alloc(&vmx_info, 0)?;
            regions.push(region);
        }

        // Enter VMX root operation on all online CPUs, then compare the accumulated
        // success mask against the online mask. The cross-CPU primitive has returned
        // by the time the mask is read, so no partial mask is observed.
        let ctx = ActivationContext::new(&regions);
        let online_mask = H::online_cpu_mask();
        H::exec_on_cpus(online_mask, &|| activate_current_cpu::<H>(&ctx));
        let active_mask = ctx.active_mask();
        if active_mask != online_mask {
            // At least one online CPU failed; roll back the ones that succeeded.
            H::exec_on_cpus(active_mask, &|| deactivate_current_cpu::<H>());
            return ax_err!(Unsupported, "could not enable VMX on all online CPUs");
        }

        debug!("VMX enabled on all online CPUs (mask {:#x})", online_mask);
        Ok(Self {
            regions,
            vpid_bitmap: VpidBitmap::new(),
        })
    }

    /// Number of CPUs a VMXON region was allocated for.
    pub fn num_cpus(&self) -> usize {
        self.regions.len()
    }

    /// Allocates the lowest free VPID.
    ///
    /// # Errors
    ///
    /// * `ResourceBusy` - every VPID is in use; the caller must wait for a release.
    /// * `InvalidData` - the free index would not fit a 16-bit VPID. Unreachable
    ///   while `NUM_VPIDS` is at most 65535.
    pub fn alloc_vpid(&mut self) -> AxResult<u16> {
        let Some(first_unset) = self.vpid_bitmap.first_unset() else {
            return ax_err!(ResourceBusy, "all VPIDs are in use");
        };
        if first_unset + 1 > u16::MAX as usize {
            return ax_err!(InvalidData, "VPID exceeds the 16-bit range");
        }
        self.vpid_bitmap.set(first_unset);
        Ok((first_unset + 1) as u16)
    }

    /// Releases a VPID returned by [`VmxCpuState::alloc_vpid`].
    ///
    /// # Errors
    ///
    /// * `InvalidInput` - `vpid` is 0 or not currently allocated. The bitmap is
    ///   left untouched.
    pub fn release_vpid(&mut self, vpid: u16) -> AxResult {
        let index = (vpid as usize).wrapping_sub(1);
        if vpid == 0 || index >= NUM_VPIDS || !self.vpid_bitmap.get(index) {
            return ax_err!(InvalidInput, "VPID is not allocated");
        }
        self.vpid_bitmap.clear(index);
        Ok(())
    }
}

impl<H: AxVmxHal> Drop for VmxCpuState<H> {
    fn drop(&mut self) {
        // Leave VMX root operation everywhere; the regions free their pages when
        // the vector is dropped.
        H::exec_on_cpus(CPU_MASK_ALL, &|| deactivate_current_cpu::<H>());
        debug!("VMX disabled on all online CPUs");
    }
}
