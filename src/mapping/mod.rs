//! Statement mapping: definition parsing, the statement registry and the
//! key/connection source provider.

pub mod parser;
pub mod provider;
pub mod registry;

pub use parser::parse_statements;
pub use provider::{ProviderRegistration, Registration, SqlMapProvider};
pub use registry::StatementRegistry;
