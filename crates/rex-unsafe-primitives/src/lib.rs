//! Rex Unsafe Primitives - Consolidated Unsafe Code TCB
//!
//! This crate contains the unsafe and lock-free code the Rex kernel needs,
//! consolidated into a single auditable location. The kernel crates use
//! `#![deny(unsafe_code)]`.
//!
//! # Module Organization
//!
//! - `region` - `'static` byte slices over fixed physical memory regions
//! - `switch` - Atomic pend-switch request and interrupt nesting tracker
//! - `loom_tests` - Concurrency tests using loom (with `loom` feature)
//!
//! # Verification
//!
//! 1. **Kani proofs** (`cargo kani`): Bounded model checking for region bounds
//! 2. **Loom tests** (`cargo test --features loom`): ISR/thread interleavings
//! 3. **Unit tests**: Traditional testing for basic functionality

#![no_std]

pub mod region;
pub mod switch;


pub use region::{region_from_raw, RegionError};
pub use switch::SwitchRequest;
