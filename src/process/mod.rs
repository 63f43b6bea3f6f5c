//! Cooperative simulation processes.
//!
//! A process is a Rust future launched with
//! [`Simulation::launch`](crate::Simulation::launch). It runs on the
//! session's single thread and only gives control back at an `.await`
//! on one of the suspension futures below. The dispatcher resumes it
//! through its `Waker`, in the order the waits were satisfied, and
//! always before the clock moves on.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`table`] | [`ProcessId`], [`ProcessState`], [`WaitReason`], the process table |
//! | [`handle`] | [`Process`], the handle passed to every body |
//! | [`wait`] | [`Delay`], [`WaitFor`] suspension futures |
//!
//! Channel operations ([`Put`](crate::channel::Put),
//! [`Take`](crate::channel::Take)) live in [`crate::channel`].

pub mod handle;
pub mod table;
pub mod wait;

pub use handle::Process;
pub use table::{ProcessId, ProcessState, WaitReason};
pub use wait::{Delay, WaitFor};
