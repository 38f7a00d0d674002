//! Ledger Bindings - Reactive Query Cache for Report Widgets
//!
//! Maps declarative ledger queries ("balance of checking as of today",
//! "net worth from January to March") to cached, incrementally maintained
//! values and notifies consumers exactly when those values change:
//!
//! - **One live computation per query**: descriptors canonicalize to a
//!   stable key, and equal keys share a single binding
//! - **Dependency-tracked invalidation**: every ledger read is recorded, and
//!   change events only dirty the bindings whose reads they touch
//! - **Coalesced recomputation**: a single worker drains a FIFO queue, so a
//!   burst of changes yields one recomputation and one notification
//! - **Ranged aggregates**: net worth series are composed from per-period
//!   bindings shared across overlapping reports
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  acquire / subscribe   ┌──────────────────────────────┐
//! │  Consumers   │───────────────────────►│         BindingCache         │
//! │  (widgets,   │◄───────────────────────│  key → Binding (one Mutex)   │
//! │  RangeAggr.) │   BindingEvent (bus)   └──────────────┬───────────────┘
//! └──────────────┘                                       │ Job queue (FIFO)
//!                                                        ▼
//!                  ┌────────────────┐   reads   ┌──────────────────────┐
//!                  │ TrackedReader  │◄──────────│    worker task       │
//!                  │ (records deps) │           │ compute / match /    │
//!                  └───────┬────────┘           │ evict                │
//!                          ▼                    └──────────▲───────────┘
//!                  ┌────────────────┐  ChangeEvent         │
//!                  │ LedgerFacade   │──────────────────────┘
//!                  └────────────────┘
//! ```

pub mod bus;
pub mod cache;
pub mod compute;
pub mod config;
pub mod descriptor;
pub mod ledger;
pub mod period;
pub mod range;
pub mod tracker;
pub mod types;

// Re-export main types for convenience
pub use bus::{BindingEvent, SubscriptionId};
pub use cache::{BindingCache, BindingCacheBuilder, BindingHandle, BindingSnapshot, BindingState, CacheStats};
pub use compute::CustomQuery;
pub use config::EngineConfig;
pub use descriptor::{canonicalize, CacheKey, EntityKind, Operation, QueryDescriptor, ResolvedQuery, Scalar};
pub use ledger::{ChangeEvent, ChangeKind, EntityRef, LedgerError, LedgerFacade};
pub use period::{Granularity, PeriodKey, TimeFrame, TimeFrameMode};
pub use range::{RangeAggregator, SeriesHandle};
pub use tracker::{with_tracking, DependencyKind, DependencyRecord, DependencySet, TrackedReader};
pub use types::*;
