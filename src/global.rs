use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::hal::AxVmxHal;
use crate::state::VmxCpuState;

struct VmxGlobalInner<H: AxVmxHal> {
    /// Number of live VPIDs. Nonzero if and only if `state` is `Some`.
    vcpus: usize,
    state: Option<VmxCpuState<H>>,
}

/// Reference-counted handle to the machine-wide VMX state.
///
/// The first successful [`VmxGlobalState::alloc_vpid`] turns VMX on across the
/// whole machine; releasing the last VPID turns it off again. The embedder owns
/// exactly one of these for the machine, typically as a `static`:
///
/// ```ignore
/// static VMX_STATE: VmxGlobalState<MyHalImpl> = VmxGlobalState::new();
///
/// let vpid = VMX_STATE.alloc_vpid()?;
/// // ... run a vCPU tagged with `vpid` ...
/// VMX_STATE.release_vpid(vpid)?;
/// ```
///
/// The live-VPID counter and the state's existence stay consistent only because
/// both are mutated under the same lock; the lock is held for the whole
/// create-or-delegate / delegate-or-destroy sequence, so machine-wide activation
/// and deactivation never overlap.
pub struct VmxGlobalState<H: AxVmxHal> {
    inner: Mutex<VmxGlobalInner<H>>,
}

impl<H: AxVmxHal> VmxGlobalState<H> {
    /// Creates an inactive handle. No hardware is touched until the first
    /// [`VmxGlobalState::alloc_vpid`].
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(VmxGlobalInner {
                vcpus: 0,
                state: None,
            }),
        }
    }

    /// Allocates a VPID, turning VMX on across the machine first if this is the
    /// first live VPID.
    ///
    /// # Errors
    ///
    /// * `Unsupported` / `NoMemory` - machine-wide activation failed; the counter
    ///   stays at zero and the machine is left fully deactivated.
    /// * `ResourceBusy` - all VPIDs are in use.
    pub fn alloc_vpid(&self) -> AxResult<u16> {
        let mut inner = self.inner.lock();
        if inner.state.is_none() {
            inner.state = Some(VmxCpuState::new()?);
        }
        let Some(state) = inner.state.as_mut() else {
            return ax_err!(BadState);
        };
        match state.alloc_vpid() {
            Ok(vpid) => {
                inner.vcpus += 1;
                Ok(vpid)
            }
            Err(e) => {
                // Only successful allocations are counted, so a failed first
                // allocation must tear the freshly-created state down again.
                if inner.vcpus == 0 {
                    inner.state = None;
                }
                Err(e)
            }
        }
    }

    /// Releases a VPID, turning VMX off across the machine if it was the last
    /// live one.
    ///
    /// # Errors
    ///
    /// * `InvalidInput` - `vpid` is 0 or not currently allocated; the counter and
    ///   the machine state are left untouched.
    pub fn release_vpid(&self, vpid: u16) -> AxResult {
        let mut inner = self.inner.lock();
        let Some(state) = inner.state.as_mut() else {
            return ax_err!(InvalidInput, "VPID is not allocated");
        };
        state.release_vpid(vpid)?;
        inner.vcpus -= 1;
        if inner.vcpus == 0 {
            inner.state = None;
        }
        Ok(())
    }

    /// Whether the machine is currently in VMX operation (at least one live VPID).
    pub fn is_active(&self) -> bool {
        self.inner.lock().state.is_some()
    }
}

impl<H: AxVmxHal> Default for VmxGlobalState<H> {
    fn default() -> Self {
        Self::new()
    }
}
