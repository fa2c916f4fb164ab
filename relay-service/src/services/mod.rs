pub mod inference;
pub mod ingress;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod staging;

pub use inference::{InferenceRequest, InferenceStage, PromptMode};
pub use ingress::{IngressPolicy, IngressStage, StoredObjectRef, UploadRequest};
pub use metrics::{get_metrics, init_metrics};
pub use registry::ReferenceRegistry;
pub use staging::{StagedFile, StagingArea};
