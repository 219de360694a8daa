//! Statement definitions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kind of a mapped SQL statement, taken from the element that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Procedure,
    /// Registered without a declared kind; accepted by queries and execute.
    #[default]
    Unknown,
}

impl StatementKind {
    /// Map a definition element name (`select`, `insert`, ...) to its kind.
    pub fn from_element(name: &str) -> Option<Self> {
        match name {
            "select" => Some(Self::Select),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "procedure" => Some(Self::Procedure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "Select",
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Procedure => "Procedure",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed SQL command.
///
/// Statements are immutable once built and are identified solely by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub text: String,
    pub kind: StatementKind,
    /// Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    /// Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Statement {
    pub fn new(id: impl Into<String>, kind: StatementKind, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            kind,
            result_type: None,
            parameter_type: None,
            timeout: None,
        }
    }

    pub fn select(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, StatementKind::Select, text)
    }

    pub fn insert(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, StatementKind::Insert, text)
    }

    pub fn update(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, StatementKind::Update, text)
    }

    pub fn delete(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, StatementKind::Delete, text)
    }

    pub fn procedure(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, StatementKind::Procedure, text)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_result_type(mut self, result_type: impl Into<String>) -> Self {
        self.result_type = Some(result_type.into());
        self
    }

    pub fn with_parameter_type(mut self, parameter_type: impl Into<String>) -> Self {
        self.parameter_type = Some(parameter_type.into());
        self
    }
}

/// Executor operation a statement is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    QueryMany,
    QueryOne,
    Scalar,
    Execute,
    Procedure,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryMany => "query_many",
            Self::QueryOne => "query_one",
            Self::Scalar => "scalar",
            Self::Execute => "execute",
            Self::Procedure => "execute_procedure",
        }
    }

    /// Whether a statement of `kind` may run under this operation.
    pub fn accepts(&self, kind: StatementKind) -> bool {
        match self {
            Self::QueryMany | Self::QueryOne => {
                matches!(kind, StatementKind::Select | StatementKind::Unknown)
            }
            Self::Procedure => kind == StatementKind::Procedure,
            Self::Scalar | Self::Execute => true,
        }
    }

    /// Human-readable description of the kinds this operation accepts.
    pub fn expected(&self) -> &'static str {
        match self {
            Self::QueryMany | Self::QueryOne => "Select",
            Self::Procedure => "Procedure",
            Self::Scalar | Self::Execute => "any kind",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_element() {
        assert_eq!(StatementKind::from_element("select"), Some(StatementKind::Select));
        assert_eq!(
            StatementKind::from_element("procedure"),
            Some(StatementKind::Procedure)
        );
        assert_eq!(StatementKind::from_element("statement"), None);
        assert_eq!(StatementKind::from_element("SELECT"), None);
    }

    #[test]
    fn test_query_operations_accept_select_and_unknown() {
        assert!(Operation::QueryMany.accepts(StatementKind::Select));
        assert!(Operation::QueryOne.accepts(StatementKind::Unknown));
        assert!(!Operation::QueryMany.accepts(StatementKind::Insert));
        assert!(!Operation::QueryOne.accepts(StatementKind::Procedure));
    }

    #[test]
    fn test_procedure_requires_procedure_kind() {
        assert!(Operation::Procedure.accepts(StatementKind::Procedure));
        assert!(!Operation::Procedure.accepts(StatementKind::Unknown));
        assert!(!Operation::Procedure.accepts(StatementKind::Select));
    }

    #[test]
    fn test_execute_and_scalar_accept_everything() {
        for kind in [
            StatementKind::Select,
            StatementKind::Insert,
            StatementKind::Update,
            StatementKind::Delete,
            StatementKind::Procedure,
            StatementKind::Unknown,
        ] {
            assert!(Operation::Execute.accepts(kind));
            assert!(Operation::Scalar.accepts(kind));
        }
    }

    #[test]
    fn test_statement_builder() {
        let stmt = Statement::select("Order.GetAll", "SELECT * FROM Orders")
            .with_timeout(Duration::from_secs(5))
            .with_result_type("Order");
        assert_eq!(stmt.kind, StatementKind::Select);
        assert_eq!(stmt.timeout, Some(Duration::from_secs(5)));
        assert_eq!(stmt.result_type.as_deref(), Some("Order"));
        assert!(stmt.parameter_type.is_none());
    }
}
