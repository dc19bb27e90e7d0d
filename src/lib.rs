//! faketree: run a command with its own view of the filesystem, hostname
//! and process tree, while keeping the uid and privileges of the caller.
//!
//! The launcher re-executes itself twice, carrying its configuration in
//! argv: the first incarnation clones into a fresh set of namespaces, the
//! second reshapes the mount table as root of the new user namespace, and
//! the third drops to the requested identity before handing off to the
//! user's command. The first two incarnations stay behind as supervisors
//! of the process tree they created.

pub mod cli;
pub mod config;
pub mod core;
pub mod exec;
pub mod kernel;
