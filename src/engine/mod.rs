// AirKV Engine - Core module structure
pub mod adapter;
pub mod config;
pub mod events;
pub mod store;

pub use adapter::{MemoryAdapter, StorageAdapter};
pub use config::StoreConfig;
pub use events::Emitter;
pub use store::StoreSession;
