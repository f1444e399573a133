pub mod backend;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod hardware;
pub mod pool;
pub mod provision;
pub mod server;

// Re-export commonly used types
pub use backend::{resolve_backends, Backend};
pub use client::{GenerationChunk, GenerationRequest, GenerationResponse, LlamaClient, RerankResult, SamplingParams};
pub use self::config::{GpuLayers, KvCacheType, PoolingStrategy, ServerConfig, ServerMode, Settings};
pub use error::{Error, Result};
pub use hardware::HardwareProfile;
pub use pool::{Lease, PoolKey, PoolStats, ServerPool};
pub use provision::{ProgressObserver, ProgressPhase, Provisioner, UpdateStatus};
pub use server::{ManagedServer, ServerLauncher, ServerProcess};
