//! Event data model and handler-side collaborators.
//!
//! Everything the delivery engine hands to (or needs from) application code
//! lives here: the record shape, descriptors, per-delivery contexts, the
//! handler pipeline and the type registry.

pub mod context;
pub mod descriptor;
pub mod pipeline;
pub mod record;
pub mod registry;

pub use context::{ContextBag, ErrorContext, Headers, MessageContext};
pub use descriptor::{Descriptor, DescriptorError, headers};
pub use pipeline::{ErrorVerdict, HandlerPipeline};
pub use record::{EventRecord, NewEvent, SharedRecord};
pub use registry::{InMemoryTypeRegistry, TypeDescriptor, TypeKind, TypeRegistry};
