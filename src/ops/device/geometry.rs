//! Work partitioning for a 1-D dispatch.

use core::fmt;

use crate::error::{DeviceError, DeviceState};

/// How `count` items are split into local groups.
///
/// The global size is `count` rounded up to a multiple of `local`; the kernel
/// bounds-checks and skips the `padding()` trailing invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGeometry {
    /// Number of real items.
    pub count: u32,
    /// Invocations per local group.
    pub local: u32,
    /// Number of local groups dispatched.
    pub groups: u32,
    /// Total invocations, `groups * local`.
    pub global: u64,
}

impl DispatchGeometry {
    /// Plans a dispatch of `count` items in groups of `local`.
    ///
    /// # Errors
    ///
    /// Fails in [`DeviceState::Dispatch`] when `local` is zero or the group
    /// count exceeds `max_groups`.
    pub fn new(count: u32, local: u32, max_groups: u32) -> Result<Self, DeviceError> {
        if local == 0 {
            return Err(DeviceError::at(
                DeviceState::Dispatch,
                "local group size must be non-zero",
            ));
        }
        let groups = count.div_ceil(local);
        if groups > max_groups {
            return Err(DeviceError::at(
                DeviceState::Dispatch,
                format!("{groups} groups of {local} exceed the device limit of {max_groups}"),
            ));
        }
        Ok(Self {
            count,
            local,
            groups,
            global: u64::from(groups) * u64::from(local),
        })
    }

    /// Invocations past the last real item.
    #[must_use]
    pub fn padding(&self) -> u64 {
        self.global - u64::from(self.count)
    }
}

impl fmt::Display for DispatchGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items, {}×{} = {} invocations",
            self.count, self.groups, self.local, self.global
        )
    }
}
