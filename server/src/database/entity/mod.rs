//! Database entities.
//!
//! We use SeaORM and target PostgreSQL (production) and SQLite (development).

pub mod sandbox;
