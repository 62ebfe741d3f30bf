//! `nimbus-core`: configuration, error composition, the default §6.2
//! collaborator implementations, and the `Nimbus` facade gluing every other
//! crate into one embeddable service (also the home of the `nimbusd` binary).

mod collaborators;
pub mod config;
mod error;
mod nimbus;

pub use collaborators::{DirectoryRootfsRegistry, InMemoryMetadataStore, TracingTelemetrySink};
pub use config::NimbusConfig;
pub use error::{NimbusError, Result};
pub use nimbus::{Nimbus, NimbusStats, SnapshotStats};
