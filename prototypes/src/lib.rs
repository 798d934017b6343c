//! Dev-only crate: houses the workspace's criterion benches (`benches/`).
//! No public API of its own — benches drive `storage`/`ingestion`/`query`
//! directly as dev-dependencies.
