pub mod chat;
pub mod config;
pub mod console;
pub mod geo;
pub mod lookup;
pub mod map;
pub mod proximity;
pub mod publisher;
pub mod remote;
#[cfg(feature = "hub")]
pub mod server;
pub mod session;
pub mod store;
pub mod subscriber;

pub use session::{SessionController, SessionHandle, SessionView};
pub use store::{MemoryStore, SessionStore};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
