#[cfg(feature = "client")]
pub mod client;
pub mod client_types;
pub mod parser;

// Re-export TLS types from kumo-tls-helper for backwards compatibility
#[cfg(feature = "client")]
pub use kumo_tls_helper::TlsOptions;
#[cfg(feature = "client")]
pub use kumo_tls_helper::{AsyncReadAndWrite, BoxedAsyncReadAndWrite};

#[cfg(feature = "client")]
pub use client::*;
pub use client_types::*;
pub use parser::*;
