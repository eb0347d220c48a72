pub mod bucket;
pub mod registry;

pub use bucket::TokenBucket;
pub use registry::AcquireContext;
pub use registry::RateLimitRegistry;
pub use registry::RegistrySettings;
