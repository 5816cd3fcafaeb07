pub mod metadata;

pub use metadata::{Endpoint, IdentityProviderMetadata, MetadataStore};
