use core::marker::PhantomData;

use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::{PhysAddr, VirtAddr, PAGE_SIZE_4K};

use crate::caps::VmxBasicInfo;
use crate::hal::AxVmxHal;

/// The physical address of an unallocated region.
const PA_INVALID: PhysAddr = PhysAddr::from_usize(0);

/// One CPU's VMXON region: a single owned, page-aligned physical page.
///
/// The region starts out unallocated and becomes valid once [`VmxRegion::alloc`]
/// succeeds. A nonzero physical address is the one and only marker of a valid
/// region; the address accessors must not be called before allocation (they panic
/// in debug builds rather than silently returning the zero sentinel). Dropping the
/// region frees the page if one was allocated.
pub struct VmxRegion<H: AxVmxHal> {
    pa: PhysAddr,
    // `fn() -> H` keeps the region `Send + Sync` regardless of `H`; the HAL is
    // only ever used through its static methods.
    _phantom: PhantomData<fn() -> H>,
}

impl<H: AxVmxHal> VmxRegion<H> {
    /// Creates an unallocated region. Dropping it without allocating is a no-op.
    pub const fn new_uninit() -> Self {
        Self {
            pa: PA_INVALID,
            _phantom: PhantomData,
        }
    }

    /// Allocates the backing page and fills it with `fill`.
    ///
    /// # Errors
    ///
    /// * `Unsupported` - the reported region size exceeds the platform page size,
    ///   or write-back memory may not be used for VMX regions. Both are capability
    ///   gates checked before any allocation is attempted.
    /// * `NoMemory` - no physical page is available.
    pub fn alloc(&mut self, vmx_info: &VmxBasicInfo, fill: u8) -> AxResult {
        debug_assert!(!self.is_allocated(), "VMX region is already allocated");

        // From Intel SDM Vol. 3, Appendix A.1: bits 44:32 report the number of bytes
        // software should allocate for the VMXON region and any VMCS region. It is a
        // value greater than 0 and at most 4096 (bit 44 is set if and only if bits
        // 43:32 are clear), so one page is always enough.
        if vmx_info.region_size as usize > PAGE_SIZE_4K {
            return ax_err!(Unsupported, "VMX region size exceeds the page size");
        }
        if !vmx_info.write_back {
            return ax_err!(Unsupported, "write-back memory unsupported for VMX regions");
        }

        self.pa = H::alloc_page().ok_or_else(|| ax_err_type!(NoMemory))?;
        // SAFETY: the page was just allocated and is exclusively owned by this region.
        unsafe {
            core::ptr::write_bytes(self.virtual_address().as_mut_ptr(), fill, PAGE_SIZE_4K);
        }
        Ok(())
    }

    /// Whether the backing page has been allocated.
    pub fn is_allocated(&self) -> bool {
        self.pa != PA_INVALID
    }

    /// The physical address of the region. Must not be called before allocation.
    pub fn physical_address(&self) -> PhysAddr {
        debug_assert!(self.is_allocated(), "VMX region is not allocated");
        self.pa
    }

    /// The virtual address of the region. Must not be called before allocation.
    pub fn virtual_address(&self) -> VirtAddr {
        debug_assert!(self.is_allocated(), "VMX region is not allocated");
        H::phys_to_virt(self.pa)
    }

    /// Writes the VMCS revision identifier into the first word of the region, as
    /// VMXON requires.
    ///
    /// Takes `&self`: the write goes to the owned backing page, not to this struct,
    /// and each CPU only ever touches its own region during activation.
    pub fn set_revision_id(&self, revision_id: u32) {
        // SAFETY: the region owns the whole allocated page, which is at least
        // `region_size` >= 4 bytes long.
        unsafe {
            (self.virtual_address().as_mut_ptr() as *mut u32).write_volatile(revision_id);
        }
    }
}

impl<H: AxVmxHal> Drop for VmxRegion<H> {
    fn drop(&mut self) {
        if self.is_allocated() {
            H::dealloc_page(self.pa);
        }
    }
}
