//! Lexical read-only gate applied before any parsing or execution.

use thiserror::Error;

/// Keywords that can change data, schema, session state or permissions.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "ALTER", "ANALYZE", "ATTACH", "BEGIN", "CALL", "COMMIT", "COPY", "CREATE", "DELETE", "DETACH",
    "DROP", "EXEC", "EXECUTE", "GRANT", "INSERT", "INTO", "LOAD", "LOCK", "MERGE", "PRAGMA",
    "REINDEX", "RELEASE", "RENAME", "REVOKE", "ROLLBACK", "SAVEPOINT", "SET", "TRUNCATE", "UNLOCK",
    "UPDATE", "UPSERT", "VACUUM",
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnsafeStatement {
    #[error("forbidden keyword `{0}`")]
    ForbiddenKeyword(String),
    #[error("statement must start with SELECT or WITH, found `{0}`")]
    NotAQuery(String),
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    #[error("empty statement")]
    Empty,
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Semicolon,
    Other,
}

/// Rejects anything that is not a single read-only query.
/// String literals, quoted identifiers and comments are ignored.
pub fn check_read_only(sql: &str) -> Result<(), UnsafeStatement> {
    let tokens = tokenize(sql);
    if tokens.is_empty() {
        return Err(UnsafeStatement::Empty);
    }
    let first_word = tokens
        .iter()
        .find_map(|token| match token {
            Token::Word(word) => Some(word.clone()),
            _ => None,
        })
        .unwrap_or_default();

    for token in &tokens {
        if let Token::Word(word) = token {
            if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
                return Err(UnsafeStatement::ForbiddenKeyword(word.clone()));
            }
        }
    }

    let mut seen_semicolon = false;
    for token in &tokens {
        match token {
            Token::Semicolon => seen_semicolon = true,
            _ if seen_semicolon => return Err(UnsafeStatement::MultipleStatements),
            _ => {}
        }
    }

    if first_word != "SELECT" && first_word != "WITH" {
        return Err(UnsafeStatement::NotAQuery(first_word));
    }
    Ok(())
}

fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        match ch {
            '\'' | '"' | '`' => {
                index = skip_quoted(&chars, index, ch);
                tokens.push(Token::Other);
            }
            '[' => {
                index = skip_quoted(&chars, index, ']');
                tokens.push(Token::Other);
            }
            '-' if chars.get(index + 1) == Some(&'-') => {
                while index < chars.len() && chars[index] != '\n' {
                    index += 1;
                }
            }
            '/' if chars.get(index + 1) == Some(&'*') => {
                index += 2;
                while index < chars.len()
                    && !(chars[index] == '*' && chars.get(index + 1) == Some(&'/'))
                {
                    index += 1;
                }
                index += 2;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                index += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = index;
                while index < chars.len() && (chars[index].is_alphanumeric() || chars[index] == '_')
                {
                    index += 1;
                }
                let word: String = chars[start..index].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            c if c.is_whitespace() => index += 1,
            _ => {
                tokens.push(Token::Other);
                index += 1;
            }
        }
    }
    tokens
}

/// Returns the index just past the closing delimiter; doubled quotes escape.
fn skip_quoted(chars: &[char], open: usize, close: char) -> usize {
    let mut index = open + 1;
    while index < chars.len() {
        if chars[index] == close {
            if chars.get(index + 1) == Some(&close) && close != ']' {
                index += 2;
                continue;
            }
            return index + 1;
        }
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::{check_read_only, UnsafeStatement};

    #[test]
    fn plain_selects_and_ctes_pass() {
        assert_eq!(check_read_only("SELECT Name FROM Account"), Ok(()));
        assert_eq!(check_read_only("  with t AS (SELECT 1 AS x) SELECT x FROM t;"), Ok(()));
        assert_eq!(check_read_only("(SELECT 1 AS x)"), Ok(()));
    }

    #[test]
    fn mutation_keywords_are_rejected_anywhere() {
        for sql in [
            "DELETE FROM Account",
            "SELECT 1; DROP TABLE Account",
            "select * from Account where Id in (select Id from Account); update Account set Name = 'x'",
            "WITH gone AS (DELETE FROM Lead RETURNING Id) SELECT Id FROM gone",
            "SELECT Name INTO backup FROM Account",
            "PRAGMA writable_schema = 1",
            "ATTACH DATABASE 'x.db' AS x",
        ] {
            assert!(
                matches!(check_read_only(sql), Err(UnsafeStatement::ForbiddenKeyword(_))),
                "{sql} should be rejected"
            );
        }
    }

    #[test]
    fn keywords_inside_literals_and_comments_are_ignored() {
        assert_eq!(
            check_read_only("SELECT Name FROM Account WHERE Name = 'Drop Shipping; Update Co'"),
            Ok(())
        );
        assert_eq!(
            check_read_only("SELECT \"Delete\" FROM Account -- update later\n"),
            Ok(())
        );
        assert_eq!(check_read_only("SELECT /* insert */ 1 AS one"), Ok(()));
        assert_eq!(check_read_only("SELECT 'it''s; DROP' AS quote"), Ok(()));
    }

    #[test]
    fn stacked_and_non_query_statements_are_rejected() {
        assert_eq!(
            check_read_only("SELECT 1 AS a; SELECT 2 AS b"),
            Err(UnsafeStatement::MultipleStatements)
        );
        assert_eq!(
            check_read_only("REPLACE INTO Account (Id) VALUES ('1')"),
            Err(UnsafeStatement::ForbiddenKeyword("INTO".to_owned()))
        );
        assert_eq!(
            check_read_only("EXPLAIN SELECT 1"),
            Err(UnsafeStatement::NotAQuery("EXPLAIN".to_owned()))
        );
        assert_eq!(check_read_only("  -- nothing\n"), Err(UnsafeStatement::Empty));
    }

    #[test]
    fn replace_function_is_not_a_mutation() {
        assert_eq!(check_read_only("SELECT REPLACE(Name, 'Inc', '') AS name FROM Account"), Ok(()));
    }
}
