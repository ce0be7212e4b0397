//! Nostalgia OS Kernel Dispatcher
//!
//! The thread dispatcher and synchronization core of the NT-style kernel:
//! the part that decides which thread runs where, blocks and wakes threads
//! on dispatcher objects, delivers APCs and drives the thread lifecycle.
//!
//! # Layout
//!
//! - **ke** - dispatcher database, wait/signal engine, objects, APCs,
//!   scheduler, thread and process lifecycle
//! - **hal** - the platform interface the dispatcher consumes (IRQL,
//!   interrupt time, context switching, software interrupts)
//! - **config** - tunables with NT defaults
//!
//! The crate is `no_std` + `alloc`. The platform constructs a [`ke::Kernel`]
//! with its [`hal::Hal`] implementation and calls into it from its clock and
//! software interrupt handlers.

#![cfg_attr(not(test), no_std)]
// Kernel APIs mirror NT signatures and take many scalar arguments.
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::type_complexity)]

extern crate alloc;

pub mod config;
pub mod hal;
pub mod ke;

pub use config::KernelConfig;
pub use hal::Hal;
pub use ke::Kernel;
