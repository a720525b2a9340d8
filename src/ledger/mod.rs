//! Bounded, expiring in-memory bookkeeping.
//!
//! These structures protect request handling from replays and from
//! unbounded memory growth. They are process-local and safe to lose on
//! restart.

pub mod expiring;
pub mod limited_map;

pub use expiring::ExpiringLedger;
pub use limited_map::LimitedMapStorage;
