//! XML statement definition parser.
//!
//! A definition document holds `select`, `insert`, `update`, `delete` and
//! `procedure` elements, either directly under the root element or inside a
//! `<statements>` container:
//!
//! ```xml
//! <sqlMap namespace="Order">
//!   <statements>
//!     <select id="Order.GetById" resultType="Order" timeout="10">
//!       SELECT * FROM Orders WHERE Id = @Id
//!     </select>
//!   </statements>
//! </sqlMap>
//! ```
//!
//! Nested markup inside a statement contributes only its text.

use crate::error::{SqlMapError, SqlMapResult};
use crate::models::{Statement, StatementKind};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashSet;
use std::time::Duration;

const CONTAINER_ELEMENT: &str = "statements";

/// Statement element being read.
struct Pending {
    statement: Statement,
    /// Element depth of the statement element itself
    depth: usize,
}

/// Parse every statement defined in `xml`. `origin` names the source in errors.
pub fn parse_statements(origin: &str, xml: &str) -> SqlMapResult<Vec<Statement>> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut seen_root = false;
    let mut pending: Option<Pending> = None;
    let mut statements: Vec<Statement> = Vec::new();
    let mut ids: HashSet<String> = HashSet::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            SqlMapError::parse(
                origin,
                format!("malformed XML at byte {}: {}", reader.buffer_position(), e),
            )
        })?;

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = local_name(e);
                if stack.is_empty() {
                    if seen_root {
                        return Err(SqlMapError::parse(origin, "multiple root elements"));
                    }
                    seen_root = true;
                }

                if pending.is_none() && is_statement_position(&stack) {
                    if let Some(kind) = StatementKind::from_element(&name) {
                        let statement = read_statement(origin, e, kind)?;
                        if is_empty {
                            finish(origin, statement, &mut ids, &mut statements)?;
                        } else {
                            pending = Some(Pending {
                                statement,
                                depth: stack.len(),
                            });
                        }
                    }
                }

                if !is_empty {
                    stack.push(name);
                }
            }
            Event::End(_) => {
                stack.pop();
                if pending.as_ref().is_some_and(|p| p.depth == stack.len()) {
                    if let Some(Pending { mut statement, .. }) = pending.take() {
                        statement.text = statement.text.trim().to_string();
                        finish(origin, statement, &mut ids, &mut statements)?;
                    }
                }
            }
            Event::Text(ref t) => {
                if let Some(p) = pending.as_mut() {
                    let text = t.unescape().map_err(|e| {
                        SqlMapError::parse(
                            origin,
                            format!("invalid text in statement '{}': {}", p.statement.id, e),
                        )
                    })?;
                    p.statement.text.push_str(&text);
                }
            }
            Event::CData(ref c) => {
                if let Some(p) = pending.as_mut() {
                    p.statement.text.push_str(&String::from_utf8_lossy(c));
                }
            }
            Event::Eof => break,
            // Declarations, comments and processing instructions
            _ => {}
        }
    }

    if !seen_root {
        return Err(SqlMapError::parse(origin, "document has no root element"));
    }
    if let Some(open) = stack.last() {
        return Err(SqlMapError::parse(
            origin,
            format!("unexpected end of document inside <{}>", open),
        ));
    }
    Ok(statements)
}

/// Statements sit directly under the root or inside the container element.
fn is_statement_position(stack: &[String]) -> bool {
    match stack {
        [_root] => true,
        [_root, container] => container == CONTAINER_ELEMENT,
        _ => false,
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn read_statement(origin: &str, e: &BytesStart<'_>, kind: StatementKind) -> SqlMapResult<Statement> {
    let mut statement = Statement::new(String::new(), kind, String::new());

    for attr in e.attributes() {
        let attr = attr.map_err(|err| SqlMapError::parse(origin, format!("invalid attribute: {}", err)))?;
        let value = attr
            .unescape_value()
            .map_err(|err| SqlMapError::parse(origin, format!("invalid attribute value: {}", err)))?
            .trim()
            .to_string();
        match attr.key.local_name().as_ref() {
            b"id" => statement.id = value,
            b"resultType" | b"resultClass" => statement.result_type = Some(value),
            b"parameterType" | b"parameterClass" => statement.parameter_type = Some(value),
            b"timeout" => {
                let secs: u64 = value.parse().map_err(|_| {
                    SqlMapError::parse(
                        origin,
                        format!(
                            "timeout '{}' on <{}> is not a whole number of seconds",
                            value,
                            kind.as_str().to_lowercase()
                        ),
                    )
                })?;
                statement.timeout = Some(Duration::from_secs(secs));
            }
            _ => {}
        }
    }

    if statement.id.is_empty() {
        return Err(SqlMapError::parse(
            origin,
            format!(
                "<{}> element without an id attribute",
                kind.as_str().to_lowercase()
            ),
        ));
    }
    Ok(statement)
}

fn finish(
    origin: &str,
    statement: Statement,
    ids: &mut HashSet<String>,
    statements: &mut Vec<Statement>,
) -> SqlMapResult<()> {
    if !ids.insert(statement.id.clone()) {
        return Err(SqlMapError::parse(
            origin,
            format!("statement id '{}' is defined more than once", statement.id),
        ));
    }
    statements.push(statement);
    Ok(())
}
