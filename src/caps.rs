use crate::hal::AxVmxHal;

/// IA32_FEATURE_CONTROL MSR.
pub(crate) const MSR_IA32_FEATURE_CONTROL: u32 = 0x003a;
/// IA32_VMX_BASIC MSR, basic VMX capability info.
pub(crate) const MSR_IA32_VMX_BASIC: u32 = 0x0480;
/// IA32_VMX_MISC MSR, miscellaneous VMX capability info.
pub(crate) const MSR_IA32_VMX_MISC: u32 = 0x0485;
/// IA32_VMX_CR0_FIXED0/FIXED1 MSRs, CR0 bits fixed to 1/0 in VMX operation.
pub(crate) const MSR_IA32_VMX_CR0_FIXED0: u32 = 0x0486;
pub(crate) const MSR_IA32_VMX_CR0_FIXED1: u32 = 0x0487;
/// IA32_VMX_CR4_FIXED0/FIXED1 MSRs, CR4 bits fixed to 1/0 in VMX operation.
pub(crate) const MSR_IA32_VMX_CR4_FIXED0: u32 = 0x0488;
pub(crate) const MSR_IA32_VMX_CR4_FIXED1: u32 = 0x0489;
/// IA32_VMX_EPT_VPID_CAP MSR, EPT and VPID capability info.
pub(crate) const MSR_IA32_VMX_EPT_VPID_CAP: u32 = 0x048c;

/// IA32_FEATURE_CONTROL lock bit. Once set, the MSR is read-only until reset.
pub(crate) const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
/// IA32_FEATURE_CONTROL bit permitting VMXON outside SMX operation.
pub(crate) const FEATURE_CONTROL_VMXON: u64 = 1 << 2;

/// CR4.VMXE, the VMX-enable bit.
pub(crate) const CR4_VMXE: u64 = 1 << 13;

/// Memory type encoding for write-back, as reported in IA32_VMX_BASIC.
const VMX_MEMORY_TYPE_WRITE_BACK: u64 = 6;

/// Extracts bits `high:low` (inclusive) of `value`.
const fn bits(value: u64, high: u32, low: u32) -> u64 {
    (value >> low) & (u64::MAX >> (63 - (high - low)))
}

/// Whether bit `pos` of `value` is set.
const fn bit(value: u64, pos: u32) -> bool {
    value & (1 << pos) != 0
}

/// Basic VMX capability info, decoded from IA32_VMX_BASIC.
///
/// A read-only snapshot; the activation protocol re-derives it on every CPU it runs
/// on rather than trusting a value read elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct VmxBasicInfo {
    /// VMCS revision identifier, written into every VMXON region and VMCS.
    pub revision_id: u32,
    /// Number of bytes software should allocate for the VMXON region and any VMCS
    /// region. Greater than 0 and at most 4096.
    pub region_size: u16,
    /// Whether write-back memory may be used for VMX regions.
    pub write_back: bool,
    /// Whether instruction information is reported on VM exits due to I/O.
    pub io_exit_info: bool,
    /// Whether the TRUE_xxx_CTLS MSRs (full VMX controls) are available.
    pub vmx_controls: bool,
}

impl VmxBasicInfo {
    /// Reads and decodes IA32_VMX_BASIC. From Intel SDM Vol. 3, Appendix A.1.
    pub fn read<H: AxVmxHal>() -> Self {
        let basic_info = H::read_msr(MSR_IA32_VMX_BASIC);
        Self {
            revision_id: bits(basic_info, 30, 0) as u32,
            region_size: bits(basic_info, 44, 32) as u16,
            write_back: bits(basic_info, 53, 50) == VMX_MEMORY_TYPE_WRITE_BACK,
            io_exit_info: bit(basic_info, 54),
            vmx_controls: bit(basic_info, 55),
        }
    }
}

/// Miscellaneous VMX capability info, decoded from IA32_VMX_MISC.
#[derive(Debug, Clone, Copy)]
pub struct VmxMiscInfo {
    /// Whether wait-for-SIPI is a supported activity state.
    pub wait_for_sipi: bool,
    /// Maximum number of entries in the VM-entry/VM-exit MSR lists.
    pub msr_list_limit: u32,
}

impl VmxMiscInfo {
    /// Reads and decodes IA32_VMX_MISC. From Intel SDM Vol. 3, Appendix A.6.
    pub fn read<H: AxVmxHal>() -> Self {
        let misc_info = H::read_msr(MSR_IA32_VMX_MISC);
        Self {
            wait_for_sipi: bit(misc_info, 8),
            msr_list_limit: (bits(misc_info, 27, 25) as u32 + 1) * 512,
        }
    }
}

/// EPT and VPID capability info, decoded from IA32_VMX_EPT_VPID_CAP.
#[derive(Debug, Clone, Copy)]
pub struct EptInfo {
    /// Whether a page-walk length of 4 is supported.
    pub page_walk_4: bool,
    /// Whether write-back memory may be used for EPT structures.
    pub write_back: bool,
    /// Whether 2MB pages are supported in EPT PDEs.
    pub pde_2mb_page: bool,
    /// Whether 1GB pages are supported in EPT PDPTEs.
    pub pdpe_1gb_page: bool,
    /// Whether accessed and dirty flags are supported for EPT.
    pub ept_flags: bool,
    /// Whether advanced VM-exit information is reported on EPT violations.
    pub exit_info: bool,
    /// Whether the INVEPT instruction is usable: the instruction itself plus both
    /// the single-context and all-context invalidation types must all be supported.
    pub invept: bool,
}

impl EptInfo {
    /// Reads and decodes IA32_VMX_EPT_VPID_CAP. From Intel SDM Vol. 3, Appendix A.10.
    pub fn read<H: AxVmxHal>() -> Self {
        let ept_info = H::read_msr(MSR_IA32_VMX_EPT_VPID_CAP);
        Self {
            page_walk_4: bit(ept_info, 6),
            write_back: bit(ept_info, 14),
            pde_2mb_page: bit(ept_info, 16),
            pdpe_1gb_page: bit(ept_info, 17),
            ept_flags: bit(ept_info, 21),
            exit_info: bit(ept_info, 22),
            invept: bit(ept_info, 20) && bit(ept_info, 25) && bit(ept_info, 26),
        }
    }
}

/// Checks a control register value against the hardware-reported fixed-bit masks.
///
/// `fixed0` reports bits that must be 1 in VMX operation, `fixed1` bits that may be
/// 1 (so a clear bit in `fixed1` must be 0 in the value). Returns `true` if `value`
/// violates either mask. Pure; callers read the FIXED0/FIXED1 MSR pair themselves.
pub const fn cr_is_invalid(value: u64, fixed0: u64, fixed1: u64) -> bool {
    !(value | !fixed0) != 0 || !(!value | fixed1) != 0
}
