//! The architectural CPU state machine (§3, §4, §6): register file, segmentation, paging
//! funnel, x87 state, exception/far-control/task-switch machinery, and the instruction
//! interpreter that drives them all, tied together behind [`cpu::Cpu`].
//!
//! Everything below `cpu` is intentionally usable on its own — each module is a context struct
//! plus free functions over it, never a method on a monolithic god-object — so it can be unit
//! tested (and reused by the cached-interpreter and recompiler backends in the sibling crates)
//! without constructing a whole `Cpu`.

pub mod cpu;
pub mod exceptions;
pub mod far_control;
pub mod fpu;
pub mod interpreter;
pub mod memory_access;
pub mod registers;
pub mod segments;
pub mod task_switch;

pub use cpu::{Cpu, CpuConfig, InterruptController, RunStop};
