//! Statement registry.

use crate::error::{SqlMapError, SqlMapResult};
use crate::mapping::parser::parse_statements;
use crate::models::Statement;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Origin recorded for statements registered in code.
const REGISTERED_ORIGIN: &str = "<registered>";

/// Statements by id, loaded from definition sources or registered in code.
///
/// At most one statement exists per id. Loading or registering an id that is
/// already present replaces it and logs a warning naming both origins, so
/// later sources can patch earlier ones.
#[derive(Debug, Default, Clone)]
pub struct StatementRegistry {
    statements: HashMap<String, Arc<Statement>>,
    origins: HashMap<String, String>,
    sources: Vec<String>,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from one definition file.
    pub fn from_file(path: impl AsRef<Path>) -> SqlMapResult<Self> {
        let mut registry = Self::new();
        registry.load(path)?;
        Ok(registry)
    }

    /// Build a registry from several files, later files overriding earlier ones.
    pub fn from_files<I, P>(paths: I) -> SqlMapResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut registry = Self::new();
        for path in paths {
            registry.load(path)?;
        }
        Ok(registry)
    }

    /// Load a definition file and return the number of statements it defined.
    ///
    /// The whole file is parsed before anything is inserted, so a parse
    /// failure leaves the registry unchanged.
    pub fn load(&mut self, path: impl AsRef<Path>) -> SqlMapResult<usize> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SqlMapError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }
        let xml = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SqlMapError::SourceNotFound {
                path: path.to_path_buf(),
            },
            _ => SqlMapError::parse(path.display().to_string(), format!("cannot read file: {}", e)),
        })?;
        self.load_str(&path.display().to_string(), &xml)
    }

    /// Load statements from an in-memory document named `origin`.
    pub fn load_str(&mut self, origin: &str, xml: &str) -> SqlMapResult<usize> {
        let statements = parse_statements(origin, xml)?;
        let count = statements.len();
        for statement in statements {
            self.insert(origin, statement);
        }
        self.sources.push(origin.to_string());
        debug!(source = %origin, statements = count, "Loaded SQL map");
        Ok(count)
    }

    /// Register a statement in code, replacing any statement with the same id.
    pub fn register(&mut self, statement: Statement) -> SqlMapResult<()> {
        if statement.id.trim().is_empty() {
            return Err(SqlMapError::configuration(
                "Statement id cannot be empty",
                "Give every registered statement a unique, non-empty id such as 'Order.GetById'",
            ));
        }
        self.insert(REGISTERED_ORIGIN, statement);
        Ok(())
    }

    fn insert(&mut self, origin: &str, statement: Statement) {
        let id = statement.id.clone();
        if let Some(previous) = self.origins.insert(id.clone(), origin.to_string()) {
            warn!(
                statement_id = %id,
                previous = %previous,
                replacement = %origin,
                "Statement id already registered; replacing it"
            );
        }
        self.statements.insert(id, Arc::new(statement));
    }

    /// Look up a statement. A missing id is `None`, never an error.
    pub fn get(&self, id: &str) -> Option<Arc<Statement>> {
        self.statements.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.statements.contains_key(id)
    }

    /// Source a statement was last loaded from.
    pub fn origin_of(&self, id: &str) -> Option<&str> {
        self.origins.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.statements.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Loaded sources in load order.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.statements.values().map(Arc::as_ref)
    }
}
