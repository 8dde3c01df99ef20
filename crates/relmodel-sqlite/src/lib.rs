//! SQLite driver for relmodel.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Implements the blocking `Connection` trait from relmodel-core over the
//! bundled libsqlite3.
//!
//! # Type Mapping
//!
//! | Value | SQLite storage |
//! |-------|----------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Json` | TEXT |
//! | `Null` | NULL |
//!
//! Reads return `Int`, `Double`, `Text`, `Bytes` or `Null`; the entity
//! schema coerces them further (booleans, JSON).

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

/// Get the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}
