//! Umbrella crate re-exporting the IA-32 core subsystems as a single dependency.
//!
//! Frontends (device models, BIOS loaders, debugger UIs, display/audio bindings) live
//! outside this workspace; see `DESIGN.md` for the scope boundary.

pub use core86_cpu as cpu;
pub use core86_jit as jit;
pub use core86_timers as timers;
