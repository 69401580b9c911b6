//! Read-only statement guard
//!
//! Generated SQL is checked before it reaches the connection. Only a single
//! `SELECT` or `WITH ... SELECT` statement passes; anything containing a
//! mutating keyword outside of string literals is rejected.

use regex::Regex;
use sdk::EngineError;
use std::sync::OnceLock;

static STRING_LITERAL: OnceLock<Regex> = OnceLock::new();
static MUTATING_KEYWORD: OnceLock<Regex> = OnceLock::new();

fn string_literal() -> &'static Regex {
    STRING_LITERAL
        .get_or_init(|| Regex::new(r"'(?:[^']|'')*'").expect("Invalid string literal pattern"))
}

fn mutating_keyword() -> &'static Regex {
    MUTATING_KEYWORD.get_or_init(|| {
        Regex::new(
            r"(?i)\b(insert|update|delete|drop|alter|create|attach|detach|pragma|vacuum|reindex|truncate|grant|revoke)\b",
        )
        .expect("Invalid mutating keyword pattern")
    })
}

/// Validate a statement and return it without trailing semicolons
pub fn ensure_read_only(sql: &str) -> Result<&str, EngineError> {
    let statement = sql.trim().trim_end_matches(';').trim_end();
    if statement.is_empty() {
        return Err(EngineError::InvalidRequest("empty query".to_string()));
    }

    let without_literals = string_literal().replace_all(statement, "''");

    if without_literals.contains(';') {
        return Err(EngineError::WriteQueryNotAllowed);
    }

    let first_word = without_literals
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if first_word != "select" && first_word != "with" {
        return Err(EngineError::WriteQueryNotAllowed);
    }

    if mutating_keyword().is_match(&without_literals) {
        return Err(EngineError::WriteQueryNotAllowed);
    }

    Ok(statement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_allowed() {
        assert_eq!(
            ensure_read_only("  SELECT * FROM equipment;  ").unwrap(),
            "SELECT * FROM equipment"
        );
        assert!(ensure_read_only(
            "WITH due AS (SELECT id FROM job WHERE due_date < date('now')) SELECT COUNT(*) FROM due"
        )
        .is_ok());
    }

    #[test]
    fn test_replace_function_allowed() {
        assert!(ensure_read_only("SELECT replace(name, '-', ' ') FROM equipment").is_ok());
        assert!(ensure_read_only("REPLACE INTO equipment VALUES (1)").is_err());
    }

    #[test]
    fn test_keywords_inside_literals_allowed() {
        assert!(ensure_read_only("SELECT * FROM job WHERE note = 'delete later; maybe'").is_ok());
    }

    #[test]
    fn test_mutations_rejected() {
        for sql in [
            "DELETE FROM equipment",
            "UPDATE job SET done = 1",
            "DROP TABLE job",
            "SELECT 1; DROP TABLE job",
            "WITH x AS (SELECT 1) INSERT INTO job SELECT * FROM x",
            "PRAGMA writable_schema = 1",
        ] {
            assert!(
                matches!(ensure_read_only(sql), Err(EngineError::WriteQueryNotAllowed)),
                "accepted: {}",
                sql
            );
        }
    }

    #[test]
    fn test_empty_rejected() {
        assert!(ensure_read_only(" ; ").is_err());
    }
}
