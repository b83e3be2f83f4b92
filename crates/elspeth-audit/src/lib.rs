//! # Elspeth Audit
//!
//! Concrete `AuditRecorder` implementations: an in-memory store for
//! tests, a `rusqlite`-backed store for durable runs, and the
//! HMAC-SHA256 fingerprinting helper shared by both config and row
//! payload hashing. The `AuditRecorder` trait itself lives in
//! `elspeth-core::audit` so that plugin traits can depend on it without
//! this crate.

pub mod export;
pub mod fingerprint;
pub mod memory;
pub mod sqlite;

pub use fingerprint::FingerprintKey;
pub use memory::InMemoryAuditRecorder;
pub use sqlite::SqliteAuditRecorder;
