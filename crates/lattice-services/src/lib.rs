//! lattice-services — the hub's domain tables: service registry, session
//! store, coordination primitives, config store cache, bundle filesystems,
//! and the persistence façade they share.

pub mod bundle;
pub mod coordination;
pub mod kv;
pub mod local_storage;
pub mod registry;
pub mod sessions;
pub mod stores;

pub use bundle::BundleFs;
pub use coordination::{MutexTable, OnceFence};
pub use kv::Kv;
pub use local_storage::LocalStorage;
pub use registry::{Registry, RegistryEvent, Service};
pub use sessions::{Session, SessionEvent, SessionStore};
pub use stores::StoreCache;
