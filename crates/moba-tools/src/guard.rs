//! Statement guard for `runQuery`.
//!
//! Only single read statements reach the database. The check is lexical: it
//! looks at the first keyword after leading comments and refuses a second
//! statement after a `;`. The read-only connection is the real boundary.

use moba_mcp::HandlerError;

/// Statement keywords a query may start with.
const ALLOWED_KEYWORDS: &[&str] = &["SELECT", "WITH", "EXPLAIN", "PRAGMA", "VALUES"];

pub const QUERY_REJECTED: &str = "QueryRejected";

/// Check `sql` against the length limit and the statement allow-list.
pub fn check_query(sql: &str, max_length: usize) -> Result<(), HandlerError> {
    let length = sql.chars().count();
    if length > max_length {
        return Err(HandlerError::new(
            QUERY_REJECTED,
            format!(
                "query is {} characters long; the limit is {}",
                length, max_length
            ),
        ));
    }

    let body = skip_comments(sql);
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if keyword.is_empty() {
        return Err(HandlerError::new(QUERY_REJECTED, "query is empty"));
    }
    if !ALLOWED_KEYWORDS.contains(&keyword.as_str()) {
        return Err(HandlerError::new(
            QUERY_REJECTED,
            format!(
                "{} statements are not allowed; use one of {}",
                keyword,
                ALLOWED_KEYWORDS.join(", ")
            ),
        ));
    }

    if has_trailing_statement(body) {
        return Err(HandlerError::new(
            QUERY_REJECTED,
            "only one statement may be executed per query",
        ));
    }
    Ok(())
}

/// Strip leading whitespace, `-- line` and `/* block */` comments.
fn skip_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.find('\n').map(|i| &rest[i + 1..]).unwrap_or("");
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.find("*/").map(|i| &rest[i + 2..]).unwrap_or("");
        } else {
            return sql;
        }
    }
}

/// Whether anything other than whitespace or comments follows an unquoted `;`.
fn has_trailing_statement(sql: &str) -> bool {
    let mut quote: Option<char> = None;
    for (i, c) in sql.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                ';' => return !skip_comments(&sql[i + 1..]).trim_start_matches(';').trim().is_empty(),
                _ => {}
            },
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_read_statements() {
        for sql in [
            "SELECT 1",
            "  select * from t",
            "WITH x AS (SELECT 1) SELECT * FROM x",
            "explain query plan select 1",
            "PRAGMA table_info(users)",
            "VALUES (1), (2)",
            "-- leading comment\nSELECT 1",
            "/* block */ SELECT 1;",
        ] {
            check_query(sql, 1000).unwrap_or_else(|e| panic!("{sql}: {e}"));
        }
    }

    #[test]
    fn test_rejects_writes() {
        for sql in [
            "DELETE FROM users",
            "insert into t values (1)",
            "DROP TABLE t",
            "ATTACH DATABASE 'x' AS y",
        ] {
            let err = check_query(sql, 1000).unwrap_err();
            assert_eq!(err.classification, QUERY_REJECTED, "{sql}");
        }
    }

    #[test]
    fn test_rejects_stacked_statements() {
        assert!(check_query("SELECT 1; DELETE FROM t", 1000).is_err());
        assert!(check_query("SELECT ';'", 1000).is_ok());
        assert!(check_query("SELECT 1; -- done", 1000).is_ok());
    }

    #[test]
    fn test_rejects_long_and_empty_queries() {
        let err = check_query("SELECT 1234567890", 8).unwrap_err();
        assert!(err.message.contains("limit is 8"));
        assert!(check_query("   ", 100).is_err());
        assert!(check_query("-- only a comment", 100).is_err());
    }
}
