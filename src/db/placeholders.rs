//! Named parameter rewriting.
//!
//! Statement text may reference parameters by name as `@Name`, `:Name` or
//! `#{Name}`. Before execution these are rewritten to the driver's positional
//! syntax and the matching values are collected in placeholder order. Text
//! inside quotes, comments and dollar-quoted blocks is left alone.
//!
//! Statements that already use positional placeholders (`?` or `$n`) bind the
//! parameter values in insertion order.

use crate::error::{SqlMapError, SqlMapResult};
use crate::models::{Param, Params, PlaceholderStyle};
use std::ops::Range;

/// Statement text rewritten for a driver, with its values in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSql {
    pub sql: String,
    pub params: Vec<Param>,
}

#[derive(Clone)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    LineComment,
    BlockComment(u32),
    DollarQuoted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Named { span: Range<usize>, name: &'a str },
    /// `?` (index `None`) or `$n`
    Positional { index: Option<usize> },
}

/// Rewrite named placeholders in `sql` and collect the bound values.
pub fn bind_params(
    statement_id: &str,
    sql: &str,
    params: &Params,
    style: PlaceholderStyle,
) -> SqlMapResult<BoundSql> {
    let tokens = scan(sql, style);
    let has_named = tokens.iter().any(|t| matches!(t, Token::Named { .. }));
    let has_positional = tokens.iter().any(|t| matches!(t, Token::Positional { .. }));

    if has_named && has_positional {
        return Err(SqlMapError::configuration(
            format!(
                "Statement '{}' mixes named and positional placeholders",
                statement_id
            ),
            "Use either @Name style placeholders or positional ones, not both",
        ));
    }

    if has_named {
        return rewrite_named(statement_id, sql, &tokens, params, style);
    }

    let needed = tokens
        .iter()
        .map(|t| match t {
            Token::Positional { index: Some(n) } => *n,
            _ => 1,
        })
        .fold((0usize, 0usize), |(count, max), n| (count + 1, max.max(n)));
    let needed = match style {
        PlaceholderStyle::Question => needed.0,
        PlaceholderStyle::Dollar => needed.1,
    };

    if params.len() < needed {
        return Err(SqlMapError::configuration(
            format!(
                "Statement '{}' expects {} positional parameters but {} were supplied",
                statement_id,
                needed,
                params.len()
            ),
            "Supply one parameter per placeholder, in placeholder order",
        ));
    }

    Ok(BoundSql {
        sql: sql.to_string(),
        params: params.values().take(needed).cloned().collect(),
    })
}

fn rewrite_named(
    statement_id: &str,
    sql: &str,
    tokens: &[Token<'_>],
    params: &Params,
    style: PlaceholderStyle,
) -> SqlMapResult<BoundSql> {
    let mut out = String::with_capacity(sql.len());
    let mut values: Vec<Param> = Vec::new();
    // Dollar style reuses one index per distinct name
    let mut dollar_names: Vec<&str> = Vec::new();
    let mut last = 0;

    for token in tokens {
        let Token::Named { span, name } = token else {
            continue;
        };
        let value = params.get(name).ok_or_else(|| {
            SqlMapError::configuration(
                format!(
                    "Statement '{}' references parameter '{}' which was not supplied",
                    statement_id, name
                ),
                format!(
                    "Add '{}' to the parameters (supplied: {})",
                    name,
                    supplied_names(params)
                ),
            )
        })?;

        out.push_str(&sql[last..span.start]);
        match style {
            PlaceholderStyle::Question => {
                out.push('?');
                values.push(value.clone());
            }
            PlaceholderStyle::Dollar => {
                let position = match dollar_names
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(name))
                {
                    Some(pos) => pos,
                    None => {
                        dollar_names.push(*name);
                        values.push(value.clone());
                        dollar_names.len() - 1
                    }
                };
                out.push('$');
                out.push_str(&(position + 1).to_string());
            }
        }
        last = span.end;
    }
    out.push_str(&sql[last..]);

    Ok(BoundSql {
        sql: out,
        params: values,
    })
}

fn supplied_names(params: &Params) -> String {
    if params.is_empty() {
        "none".to_string()
    } else {
        params.names().collect::<Vec<_>>().join(", ")
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn scan_ident(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    while idx < bytes.len() && is_ident_char(bytes[idx]) {
        idx += 1;
    }
    idx
}

fn scan_digits(bytes: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut idx = start;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == start {
        return None;
    }
    std::str::from_utf8(&bytes[start..idx])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .map(|n| (idx, n))
}

fn is_block_comment_start(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'/') && bytes.get(idx + 1) == Some(&b'*')
}

fn is_block_comment_end(bytes: &[u8], idx: usize) -> bool {
    bytes.get(idx) == Some(&b'*') && bytes.get(idx + 1) == Some(&b'/')
}

/// Start of a `$tag$` block; returns the tag and the index of its closing `$`.
fn try_start_dollar_quote(bytes: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx = start + 1;
    while idx < bytes.len() && bytes[idx] != b'$' {
        if !is_ident_char(bytes[idx]) || (idx == start + 1 && bytes[idx].is_ascii_digit()) {
            return None;
        }
        idx += 1;
    }
    if idx < bytes.len() {
        let tag = String::from_utf8(bytes[start + 1..idx].to_vec()).ok()?;
        Some((tag, idx))
    } else {
        None
    }
}

fn matches_tag(bytes: &[u8], idx: usize, tag: &str) -> bool {
    let end = idx + 1 + tag.len();
    end < bytes.len() && &bytes[idx + 1..end] == tag.as_bytes() && bytes[end] == b'$'
}

fn scan(sql: &str, style: PlaceholderStyle) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut state = State::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'`' => state = State::Backtick,
                b'-' if bytes.get(idx + 1) == Some(&b'-') => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment(1);
                    idx += 1;
                }
                b'@' if bytes.get(idx + 1) == Some(&b'@') => {
                    // @@system_variable
                    idx = scan_ident(bytes, idx + 2) - 1;
                }
                b'@' | b':' if bytes.get(idx + 1).copied().is_some_and(is_ident_start) => {
                    let end = scan_ident(bytes, idx + 1);
                    tokens.push(Token::Named {
                        span: idx..end,
                        name: &sql[idx + 1..end],
                    });
                    idx = end - 1;
                }
                b':' if bytes.get(idx + 1) == Some(&b':') => {
                    // ::type cast
                    idx += 1;
                }
                b'#' if bytes.get(idx + 1) == Some(&b'{') => {
                    if let Some(close) = sql[idx + 2..].find('}') {
                        let end = idx + 2 + close + 1;
                        let inner = &sql[idx + 2..end - 1];
                        let name = inner.split(',').next().unwrap_or_default().trim();
                        tokens.push(Token::Named {
                            span: idx..end,
                            name,
                        });
                        idx = end - 1;
                    }
                }
                b'?' if style == PlaceholderStyle::Question => {
                    tokens.push(Token::Positional { index: None });
                }
                b'$' => {
                    if let Some((tag, close)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        idx = close;
                    } else if let Some((end, n)) = scan_digits(bytes, idx + 1) {
                        if style == PlaceholderStyle::Dollar {
                            tokens.push(Token::Positional { index: Some(n) });
                        }
                        idx = end - 1;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1; // skip escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Backtick => {
                if b == b'`' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    idx += 1;
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    idx += 1;
                }
            }
            State::DollarQuoted(ref tag) => {
                if b == b'$' && matches_tag(bytes, idx, tag) {
                    idx += tag.len() + 1;
                    state = State::Normal;
                }
            }
        }
        idx += 1;
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Params {
        Params::new().with("Id", 5).with("Name", "x")
    }

    #[test]
    fn test_at_style_to_question() {
        let bound = bind_params(
            "T.Update",
            "UPDATE T SET Name=@Name WHERE Id=@Id",
            &params(),
            PlaceholderStyle::Question,
        )
        .unwrap();
        assert_eq!(bound.sql, "UPDATE T SET Name=? WHERE Id=?");
        assert_eq!(
            bound.params,
            vec![Param::String("x".to_string()), Param::Int(5)]
        );
    }

    #[test]
    fn test_dollar_style_reuses_indexes() {
        let bound = bind_params(
            "T.Find",
            "SELECT * FROM T WHERE Id = :id OR Parent = :Id OR Name = #{Name, jdbcType=VARCHAR}",
            &params(),
            PlaceholderStyle::Dollar,
        )
        .unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM T WHERE Id = $1 OR Parent = $1 OR Name = $2"
        );
        assert_eq!(bound.params.len(), 2);
    }

    #[test]
    fn test_skips_quotes_comments_and_casts() {
        let sql = "SELECT '@Name', \"a:b\", Id::text -- @Id\n/* :Name */ FROM T WHERE Id = @Id";
        let bound = bind_params("T.Q", sql, &params(), PlaceholderStyle::Dollar).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT '@Name', \"a:b\", Id::text -- @Id\n/* :Name */ FROM T WHERE Id = $1"
        );
        assert_eq!(bound.params, vec![Param::Int(5)]);
    }

    #[test]
    fn test_skips_dollar_quoted_and_system_variables() {
        let sql = "SELECT $body$ @Name $body$, @@session.sql_mode, @Id";
        let bound = bind_params("T.Q", sql, &params(), PlaceholderStyle::Question).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT $body$ @Name $body$, @@session.sql_mode, ?"
        );
    }

    #[test]
    fn test_missing_parameter_is_configuration_error() {
        let err = bind_params(
            "T.Q",
            "SELECT * FROM T WHERE Code = @Code",
            &params(),
            PlaceholderStyle::Question,
        )
        .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Code"));
    }

    #[test]
    fn test_positional_binds_in_insertion_order() {
        let bound = bind_params(
            "T.Q",
            "SELECT * FROM T WHERE Id = ? AND Name = ?",
            &params(),
            PlaceholderStyle::Question,
        )
        .unwrap();
        assert_eq!(
            bound.params,
            vec![Param::Int(5), Param::String("x".to_string())]
        );

        let bound = bind_params(
            "T.Q",
            "SELECT * FROM T WHERE Id = $1",
            &params(),
            PlaceholderStyle::Dollar,
        )
        .unwrap();
        assert_eq!(bound.params, vec![Param::Int(5)]);
    }

    #[test]
    fn test_no_placeholders_binds_nothing() {
        let bound =
            bind_params("T.All", "SELECT 1 AS N", &params(), PlaceholderStyle::Question).unwrap();
        assert_eq!(bound.sql, "SELECT 1 AS N");
        assert!(bound.params.is_empty());
    }

    #[test]
    fn test_too_few_positional_parameters() {
        let err = bind_params(
            "T.Q",
            "SELECT ? , ?, ?",
            &params(),
            PlaceholderStyle::Question,
        )
        .unwrap_err();
        assert!(err.to_string().contains("expects 3"));
    }

    #[test]
    fn test_mixed_placeholders_rejected() {
        let err = bind_params(
            "T.Q",
            "SELECT * FROM T WHERE Id = ? AND Name = @Name",
            &params(),
            PlaceholderStyle::Question,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mixes"));
    }

    #[test]
    fn test_assignment_operator_is_not_a_placeholder() {
        let bound = bind_params(
            "T.Q",
            "SET @total := @Id",
            &params(),
            PlaceholderStyle::Question,
        );
        // @total is treated as a named placeholder and is missing
        assert!(bound.is_err());

        let bound =
            bind_params("T.Q", "SELECT x := 1", &Params::new(), PlaceholderStyle::Question).unwrap();
        assert!(bound.params.is_empty());
    }
}
