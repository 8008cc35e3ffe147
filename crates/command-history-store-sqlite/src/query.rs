//! Runs the repository's document-SQL against the `core_documents` table.
//!
//! `c.<path>` references become `json_extract(document, '$.<path>')`; the
//! `@name` parameters are bound natively by SQLite.

use command_history_core::{CommandHistoryError, QuerySpec, QueryValue, Result};
use rusqlite::types::Value;

const DOCUMENT_SQL_PREFIX: &str = "SELECT * FROM c WHERE ";
const CONTINUATION_PARAMETER: &str = "@__after_rowid";
const LIMIT_PARAMETER: &str = "@__limit";

/// Paged SQL for `query`, resuming after the rowid in `continuation`.
pub(crate) fn page_sql(query: &QuerySpec) -> Result<String> {
    let predicate = translate_predicate(query)?;
    Ok(format!(
        "SELECT rowid, etag, document FROM core_documents \
         WHERE ({predicate}) AND rowid > {CONTINUATION_PARAMETER} \
         ORDER BY rowid LIMIT {LIMIT_PARAMETER}"
    ))
}

/// Bindings for [`page_sql`], including the paging parameters.
pub(crate) fn page_bindings(
    query: &QuerySpec,
    continuation: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, Value)>> {
    let after_rowid = match continuation {
        Some(token) => token.trim().parse::<i64>().map_err(|err| {
            CommandHistoryError::InvalidArgument(format!("invalid continuation token `{token}`: {err}"))
        })?,
        None => 0,
    };
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let mut bindings = query
        .parameters
        .iter()
        .map(|parameter| (parameter.name.clone(), sql_value(&parameter.value)))
        .collect::<Vec<_>>();
    bindings.push((CONTINUATION_PARAMETER.to_string(), Value::Integer(after_rowid)));
    bindings.push((LIMIT_PARAMETER.to_string(), Value::Integer(limit)));
    Ok(bindings)
}

fn sql_value(value: &QueryValue) -> Value {
    match value {
        QueryValue::Integer(value) => Value::Integer(*value),
        QueryValue::Bool(value) => Value::Integer(i64::from(*value)),
        QueryValue::Text(value) => Value::Text(value.clone()),
    }
}

/// Rewrites the WHERE clause of a `SELECT * FROM c WHERE ...` query into SQLite.
pub(crate) fn translate_predicate(query: &QuerySpec) -> Result<String> {
    let Some(predicate) = query.text.strip_prefix(DOCUMENT_SQL_PREFIX) else {
        return Err(CommandHistoryError::InvalidArgument(format!(
            "unsupported document query: {}",
            query.text
        )));
    };

    let chars = predicate.chars().collect::<Vec<_>>();
    let mut translated = String::with_capacity(predicate.len() * 2);
    let mut index = 0;
    while index < chars.len() {
        let at_boundary = index == 0 || !is_identifier_char(chars[index - 1]);
        if at_boundary && chars[index] == 'c' && chars.get(index + 1) == Some(&'.') {
            let start = index + 2;
            let mut end = start;
            while end < chars.len() && is_path_char(chars[end]) {
                end += 1;
            }
            let path = chars[start..end].iter().collect::<String>();
            let path = path.trim_end_matches('.');
            if path.is_empty() {
                return Err(CommandHistoryError::InvalidArgument(format!(
                    "empty document path in query: {}",
                    query.text
                )));
            }
            translated.push_str(&format!("json_extract(document, '$.{path}')"));
            index = start + path.chars().count();
            continue;
        }

        translated.push(chars[index]);
        index += 1;
    }

    Ok(translated)
}

fn is_path_char(value: char) -> bool {
    value.is_ascii_alphanumeric() || value == '_' || value == '.'
}

fn is_identifier_char(value: char) -> bool {
    value.is_ascii_alphanumeric() || value == '_' || value == '@' || value == '.'
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_history_core::QueryParameter;

    fn document_query(text: &str) -> QuerySpec {
        QuerySpec {
            text: text.to_string(),
            parameters: vec![QueryParameter {
                name: "@createdTime".to_string(),
                value: QueryValue::Integer(10),
            }],
        }
    }

    #[test]
    fn document_paths_become_json_extract_calls() {
        let translated = match translate_predicate(&document_query(
            "SELECT * FROM c WHERE c.s.puid = @puid AND c.crt >= @createdTime",
        )) {
            Ok(value) => value,
            Err(err) => panic!("translation failed: {err}"),
        };
        assert_eq!(
            translated,
            "json_extract(document, '$.s.puid') = @puid AND json_extract(document, '$.crt') >= @createdTime"
        );
    }

    #[test]
    fn parameters_and_grouping_are_left_alone() {
        let translated = match translate_predicate(&document_query(
            "SELECT * FROM c WHERE  c.r IN (@requester_0,@requester_1) AND (c.ct = @commandType0 OR c.ct = @commandType1)",
        )) {
            Ok(value) => value,
            Err(err) => panic!("translation failed: {err}"),
        };
        assert_eq!(
            translated,
            " json_extract(document, '$.r') IN (@requester_0,@requester_1) AND (json_extract(document, '$.ct') = @commandType0 OR json_extract(document, '$.ct') = @commandType1)"
        );
    }

    #[test]
    fn foreign_queries_are_rejected() {
        assert!(matches!(
            translate_predicate(&document_query("DELETE FROM c")),
            Err(CommandHistoryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn continuation_token_must_be_a_rowid() {
        let query = document_query("SELECT * FROM c WHERE c.crt >= @createdTime");
        assert!(matches!(
            page_bindings(&query, Some("abc"), 10),
            Err(CommandHistoryError::InvalidArgument(_))
        ));
        let bindings = match page_bindings(&query, Some("42"), 10) {
            Ok(value) => value,
            Err(err) => panic!("bindings failed: {err}"),
        };
        assert!(bindings.contains(&(CONTINUATION_PARAMETER.to_string(), Value::Integer(42))));
        assert!(bindings.contains(&(LIMIT_PARAMETER.to_string(), Value::Integer(10))));
    }
}
