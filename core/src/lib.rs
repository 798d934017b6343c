pub mod audit;
pub mod auth;
pub mod config;
pub mod embedding;
pub mod error;
pub mod governance;
pub mod ingest;
pub mod kv;
pub mod metrics;
pub mod model;
pub mod tempid;
pub mod typeid;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
