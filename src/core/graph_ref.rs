use std::fmt;
use std::str::FromStr;

use crate::core::error::RelayError;

/// A `graphID@variantID` pair, the unit of addressing for a graph variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphRef {
    pub graph_id: String,
    pub variant_id: String,
}

impl FromStr for GraphRef {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('@');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(graph_id), Some(variant_id), None) => Ok(Self {
                graph_id: graph_id.to_string(),
                variant_id: variant_id.to_string(),
            }),
            _ => Err(RelayError::InvalidGraphRef(s.to_string())),
        }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.graph_id, self.variant_id)
    }
}
