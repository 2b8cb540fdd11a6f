//! # Offline Caches
//!
//! Persisted caches consulted during offline verification:
//! - **Credentials**: signed assertions and their offline trust horizon
//! - **Templates**: encrypted biometric enrollments and their eligibility
//!
//! Both are read-mostly. Reads clone an `Arc` under a shared lock; writes
//! are serialized per identity through a shared [`IdentityLocks`].

pub mod credential;
pub mod locks;
pub mod template;

pub use credential::{CredentialCache, CredentialCacheStats};
pub use locks::IdentityLocks;
pub use template::{
    EligibleTemplates, TemplateCache, TemplateCacheStats, TemplateEnrollment, TemplateScope,
};
