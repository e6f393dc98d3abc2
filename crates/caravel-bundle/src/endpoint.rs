//! DTN endpoint identifiers
//!
//! An endpoint names a node or an application on a node, written as a
//! `dtn://node/application` URI. The null endpoint `dtn:none` is used where
//! the bundle protocol requires an endpoint field but none applies
//! (report-to and custodian default to it).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BundleError;

/// A DTN endpoint identifier
///
/// Ordering is lexicographic on (node, application), which gives bundle
/// identities a stable total order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    node: String,
    application: Option<String>,
}

impl EndpointId {
    /// Create a node-level endpoint (`dtn://node`)
    pub fn node(name: impl Into<String>) -> Result<Self, BundleError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(BundleError::InvalidEndpoint(name));
        }
        Ok(Self {
            node: name,
            application: None,
        })
    }

    /// Create an application endpoint (`dtn://node/application`)
    pub fn application(
        node: impl Into<String>,
        application: impl Into<String>,
    ) -> Result<Self, BundleError> {
        let mut endpoint = Self::node(node)?;
        let application = application.into();
        if application.is_empty() {
            return Err(BundleError::InvalidEndpoint(application));
        }
        endpoint.application = Some(application);
        Ok(endpoint)
    }

    /// The null endpoint `dtn:none`
    pub fn null() -> Self {
        Self {
            node: String::new(),
            application: None,
        }
    }

    /// Parse an endpoint URI (`dtn://node/application`, `dtn://node` or `dtn:none`)
    pub fn parse(uri: &str) -> Result<Self, BundleError> {
        if uri == "dtn:none" {
            return Ok(Self::null());
        }

        let rest = uri
            .strip_prefix("dtn://")
            .ok_or_else(|| BundleError::InvalidEndpoint(uri.to_string()))?;

        match rest.split_once('/') {
            Some((node, application)) => Self::application(node, application),
            None => Self::node(rest),
        }
    }

    /// Whether this is the null endpoint
    pub fn is_null(&self) -> bool {
        self.node.is_empty()
    }

    /// The node part of this endpoint
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// The application part, if any
    pub fn application_name(&self) -> Option<&str> {
        self.application.as_deref()
    }

    /// The node-level endpoint this endpoint belongs to
    pub fn node_endpoint(&self) -> EndpointId {
        Self {
            node: self.node.clone(),
            application: None,
        }
    }

    /// Match another endpoint either exactly or at node level
    ///
    /// With `exact` set the full endpoint must match; otherwise a bundle
    /// addressed to any application on the same node matches.
    pub fn matches(&self, other: &EndpointId, exact: bool) -> bool {
        if exact {
            self == other
        } else {
            !self.is_null() && self.node == other.node
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "dtn:none");
        }
        match &self.application {
            Some(application) => write!(f, "dtn://{}/{}", self.node, application),
            None => write!(f, "dtn://{}", self.node),
        }
    }
}
