use memory_addr::{PhysAddr, VirtAddr};

/// CPU mask targeting every online CPU.
pub const CPU_MASK_ALL: usize = usize::MAX;

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
///
/// Everything the VMX lifecycle needs from the machine is routed through this trait:
/// raw register access, the VMX instructions themselves, physical page management and
/// the cross-CPU execution primitive. Implementations on real hardware are thin
/// wrappers around `rdmsr`/`wrmsr`, `mov crN`, `vmxon`/`vmxoff` and the kernel's
/// page allocator; tests implement it with an in-memory machine model.
pub trait AxVmxHal {
    /// Reads the model-specific register `msr`.
    fn read_msr(msr: u32) -> u64;

    /// Writes `value` to the model-specific register `msr`.
    fn write_msr(msr: u32, value: u64);

    /// Reads the CR0 control register of the current CPU.
    fn read_cr0() -> u64;

    /// Reads the CR4 control register of the current CPU.
    fn read_cr4() -> u64;

    /// Writes the CR4 control register of the current CPU.
    fn write_cr4(value: u64);

    /// Executes VMXON with the given VMXON region, entering VMX root operation on
    /// the current CPU.
    ///
    /// # Returns
    ///
    /// * `true` if the instruction succeeded, `false` otherwise. The hardware does
    ///   not report a richer error for VMXON.
    fn vmxon(region: PhysAddr) -> bool;

    /// Executes VMXOFF, leaving VMX root operation on the current CPU.
    fn vmxoff() -> bool;

    /// Allocates one physical page, or `None` if no memory is available.
    fn alloc_page() -> Option<PhysAddr>;

    /// Frees a physical page previously returned by [`AxVmxHal::alloc_page`].
    fn dealloc_page(paddr: PhysAddr);

    /// Converts a physical address to a virtual address the kernel can access.
    fn phys_to_virt(paddr: PhysAddr) -> VirtAddr;

    /// Returns the id of the current CPU.
    fn current_cpu_id() -> usize;

    /// Returns the maximum number of CPUs the machine can have. CPU ids are below
    /// this bound whether or not the CPU is online.
    fn max_cpu_num() -> usize;

    /// Returns the mask of currently online CPUs (bit `n` set iff CPU `n` is online).
    fn online_cpu_mask() -> usize;

    /// Runs `f` on every online CPU whose bit is set in `mask`, blocking the caller
    /// until all targeted CPUs have finished executing it.
    ///
    /// Pass [`CPU_MASK_ALL`] to target every online CPU. The blocking contract is
    /// the only synchronization the callers rely on: once this returns, all side
    /// effects of `f` on the targeted CPUs are visible to the caller.
    fn exec_on_cpus(mask: usize, f: &(dyn Fn() + Sync));
}
