//! Process-wide synchronization primitives shared across the control plane.

mod locker;

pub use locker::{Locker, LockerGuard};
