//! # Gateway - ShoalKV HTTP surface
//!
//! A small axum service in front of an [`engine::Engine`]:
//!
//! ```text
//! POST   /write?key=&value=        store a pair             {status, key}
//! GET    /read?key=                look up a key            {key, value}
//! DELETE /delete?key=              delete a key             {status, key}
//! GET    /scan?start=&end=&limit=  ordered range            {items, next}
//! GET    /health                   liveness probe           {status, timestamp}
//! GET    /metrics                  Prometheus text
//! GET    /stats                    {key_count, database_size_bytes, uptime_seconds}
//! POST   /admin/flush              flush memtables          {status}
//! POST   /admin/compact            compact segments         {status}
//! ```
//!
//! Engine error kinds map onto statuses: invalid request 400, not found 404,
//! unavailable 503, everything else 500 with a generic body.

pub mod metrics;
pub mod server;

pub use server::{create_router, AppState};
