//! Guards for text that ends up inside generated SQL.
//!
//! Provides:
//! - Identifier validation for session names, work schemas and staging tables
//! - Staging-name sanitising from arbitrary instance/table names
//! - Deny-list checks for raw fragments (filters, load expressions)
//!
//! Column and table names coming from the catalog are always quoted by the
//! dialect; these checks cover names keyfill builds itself and fragments that
//! are spliced in verbatim.

use crate::error::Error;

/// Longest name SQL Server accepts for a temporary table
pub const MAX_STAGING_NAME_LEN: usize = 116;

/// Validate a SQL identifier (session, schema, staging names).
///
/// - Must not be empty
/// - Maximum 128 characters
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use keyfill::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("nightly_202401").is_ok());
/// assert!(validate_sql_identifier("_work").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1st").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 128 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 128)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(Error::config(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Join name parts into a valid identifier.
///
/// Characters outside `[A-Za-z0-9_]` become `_`, a leading digit gets a `_`
/// prefix, and the result is cut to `max_len` characters.
///
/// # Examples
///
/// ```
/// use keyfill::security::sanitize_identifier;
///
/// assert_eq!(
///     sanitize_identifier(&["nightly", "db-01:1433", "dbo", "Order Lines"], 116),
///     "nightly_db_01_1433_dbo_Order_Lines"
/// );
/// ```
pub fn sanitize_identifier(parts: &[&str], max_len: usize) -> String {
    let joined = parts.join("_");
    let mut out: String = joined
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out.truncate(max_len);
    out
}

/// Validate a raw SQL fragment spliced into generated statements.
///
/// Filters and load expressions come from job configuration and cannot be
/// parameterised. Statement terminators, comments and backslash escapes are
/// rejected. This is a deny-list, not a parser: fragments must come from
/// trusted configuration.
///
/// # Examples
///
/// ```
/// use keyfill::security::validate_sql_fragment;
///
/// assert!(validate_sql_fragment("filter", "[SRC].[status] <> 'void'").is_ok());
/// assert!(validate_sql_fragment("filter", "1=1; DROP TABLE users").is_err());
/// assert!(validate_sql_fragment("expression", "a -- b").is_err());
/// ```
pub fn validate_sql_fragment(kind: &str, fragment: &str) -> crate::Result<()> {
    if fragment.trim().is_empty() {
        return Err(Error::config(format!("{} cannot be empty", kind)));
    }

    if fragment.len() > 4096 {
        return Err(Error::config(format!(
            "{} too long: {} chars (max 4096)",
            kind,
            fragment.len()
        )));
    }

    let prohibited = [";", "--", "/*", "*/", "\\"];
    if let Some(p) = prohibited.iter().find(|p| fragment.contains(**p)) {
        return Err(Error::config(format!(
            "{} contains prohibited sequence '{}': {}",
            kind, p, fragment
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rules() {
        assert!(validate_sql_identifier("a").is_ok());
        assert!(validate_sql_identifier(&"a".repeat(128)).is_ok());
        assert!(validate_sql_identifier(&"a".repeat(129)).is_err());
        for bad in ["a.b", "a b", "a#", "[a]", "tabl\u{0435}", "x\0"] {
            assert!(validate_sql_identifier(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_sanitize_produces_valid_identifier() {
        let name = sanitize_identifier(&["2024", "sql.example.com", "dbo", "t"], 116);
        assert!(name.starts_with("_2024"));
        assert!(validate_sql_identifier(&name).is_ok());

        let long = sanitize_identifier(&[&"x".repeat(200)], MAX_STAGING_NAME_LEN);
        assert_eq!(long.len(), MAX_STAGING_NAME_LEN);
    }

    #[test]
    fn test_fragment_rules() {
        assert!(validate_sql_fragment("filter", "   ").is_err());
        assert!(validate_sql_fragment("filter", "a /* x */").is_err());
        assert!(validate_sql_fragment("filter", "a = 'x\\'").is_err());
        assert!(validate_sql_fragment("expression", "UPPER([SRC].[code])").is_ok());
    }
}
