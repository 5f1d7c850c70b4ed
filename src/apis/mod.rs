//! Cluster-facing APIs: the custom backend resources, their admission
//! validation, and the Ingress status reconciler.

pub mod admission;
pub mod status;
pub mod v1alpha1;
