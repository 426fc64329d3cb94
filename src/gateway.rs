mod layout;
mod memory;
mod tag_index;
mod traits;

pub use layout::{LayoutConnector, LayoutGateway};
pub use memory::{Call, MemoryConnector, MemoryRegistry, Operation};
pub use tag_index::TagIndex;
pub use traits::{Connector, Descriptor, Manifest, RegistryGateway, OCI_IMAGE_MANIFEST};
