//! Simulated equity-trading backend.
//!
//! Orders are admitted against a cash/holdings ledger, then driven through
//! a probabilistic execution pipeline: a partitioned in-process bus feeds
//! matching workers that fill each attempt with a jittered probability,
//! reschedule misses at three-minute intervals, and force-fill the sixth
//! attempt. Orders admitted while the market is closed park as RESERVED
//! and are re-anchored to the live price at the next open.
//!
//! Runtime state is in-memory and authoritative; Postgres is a write-behind
//! journal replayed at startup.

pub mod admission;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod opener;
pub mod oracle;
pub mod orders;
pub mod retry;
pub mod state;
pub mod stocks;
pub mod store;
pub mod tasks;
pub mod worker;
