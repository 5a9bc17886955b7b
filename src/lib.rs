// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmxState - machine-wide VMX lifecycle and VPID management for ArceOS hypervisors.
//!
//! This crate brings a multi-core x86 machine into and out of VMX root operation and
//! allocates virtual-processor identifiers (VPIDs) while the machine is virtualizing.
//! It is the bring-up layer beneath any vCPU implementation: before a single guest
//! instruction can run, every online CPU is individually checked against the VMX
//! capability MSRs and switched into VMX root operation, with all-or-nothing semantics
//! across the whole machine. A vCPU may be scheduled onto any CPU, so a machine with
//! only some CPUs in VMX operation is unusable.
//!
//! All hardware access goes through the [`AxVmxHal`] trait, so the underlying kernel
//! or hypervisor supplies MSR/control-register access, the VMXON/VMXOFF instructions,
//! a physical page allocator, and a synchronous cross-CPU execution primitive. This
//! also makes the whole crate testable on a host without VMX hardware.
//!
//! # Features
//!
//! - Decoding of the IA32_VMX_BASIC / IA32_VMX_MISC / IA32_VMX_EPT_VPID_CAP MSRs
//! - Per-CPU VMXON region management (one owned physical page per CPU)
//! - All-or-nothing VMXON across all online CPUs, with rollback on partial failure
//! - First-fit VPID allocation (VPIDs `1..=NUM_VPIDS`, 0 reserved for the host)
//! - Reference-counted machine-wide lifecycle: the first VPID allocation turns VMX
//!   on everywhere, releasing the last VPID turns it off everywhere

#![no_std]

#[macro_use]
extern crate alloc;

// Core modules
mod caps; // VMX capability MSR decoding and the fixed-bit control register check
mod global; // Reference-counted machine-wide VMX lifecycle
mod hal; // Hardware abstraction layer interface
mod percpu; // Per-CPU VMX activation and deactivation protocol
mod region; // Per-CPU VMXON region (one owned physical page)
mod state; // Machine-wide VMX state and the VPID allocator

// Public API exports
pub use caps::{cr_is_invalid, EptInfo, VmxBasicInfo, VmxMiscInfo};
pub use global::VmxGlobalState;
pub use hal::{AxVmxHal, CPU_MASK_ALL};
pub use region::VmxRegion;
pub use state::{VmxCpuState, NUM_VPIDS};
