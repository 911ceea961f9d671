pub mod factory;
pub mod registry;

pub use factory::{EndpointFactory, EndpointFactoryError};
pub use registry::{EndpointRegistry, EndpointRegistryError};
