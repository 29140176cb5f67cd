//! Splitting a desired-state document set into plain resources and
//! embedded child Application definitions.

use std::collections::BTreeSet;

use rudder_core::manifest::{application_from_document, is_application_document};
use rudder_core::{Application, Resource};
use serde_json::Value;

use crate::error::DocumentError;

/// The two halves of a document set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    /// Resources to converge directly, in source order.
    pub resources: Vec<Resource>,
    /// Child Applications declared by the document set, in source order.
    pub applications: Vec<Application>,
}

/// Partition `documents`, placing namespaced resources without an explicit
/// namespace into `default_namespace`.
///
/// Any invalid document fails the whole set: converging a partial desired
/// state could prune resources that are still declared.
pub fn partition(documents: &[Value], default_namespace: &str) -> Result<Partition, DocumentError> {
    let mut out = Partition::default();
    let mut keys = BTreeSet::new();
    let mut names = BTreeSet::new();

    for (index, doc) in documents.iter().enumerate() {
        let invalid = |source| DocumentError::Invalid { index, source };
        if is_application_document(doc) {
            let app = application_from_document(doc).map_err(invalid)?;
            if !names.insert(app.name.clone()) {
                return Err(DocumentError::DuplicateApplication { name: app.name });
            }
            out.applications.push(app);
        } else {
            let resource = Resource::from_manifest(doc.clone(), default_namespace).map_err(invalid)?;
            if !keys.insert(resource.key.clone()) {
                return Err(DocumentError::DuplicateResource { key: resource.key });
            }
            out.resources.push(resource);
        }
    }
    Ok(out)
}
