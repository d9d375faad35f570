//! Warden filter engine.
//!
//! Merges the user's selected block-lists and allow-lists into one
//! [`BlockSet`] of denied host names, with TTL-based cache invalidation and
//! incremental re-download of list content. Downstream consumers (the packet
//! pump's DNS gate) read immutable snapshots; compilation never mutates a
//! published set, it republishes a new one.

mod blockset;
mod compiler;
mod filter;
mod gate;

pub use blockset::{BlockSet, BlockSetHandle};
pub use compiler::{CompileError, CompilerConfig, FilterCompiler, HostFetcher};
pub use filter::{parse_hosts, Filter, FilterId, FilterSource};
pub use gate::{DnsGate, Verdict};
