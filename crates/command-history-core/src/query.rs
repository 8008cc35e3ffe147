//! Parameterized document-SQL for every scan the repository issues.
//!
//! The builders are pure: callers resolve "now", feature flags and the
//! max-age clamp before calling in. Timestamps are bound as unix seconds.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::record::PrivacyCommandType;
use crate::subject::{PrivacySubject, SubjectType};

const SELECT_ALL: &str = "SELECT * FROM c WHERE ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Integer(i64),
    Bool(bool),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: QueryValue,
}

/// Query text plus its named `@parameters`, in the order they were bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub text: String,
    pub parameters: Vec<QueryParameter>,
}

impl QuerySpec {
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&QueryValue> {
        self.parameters
            .iter()
            .find(|parameter| parameter.name == name)
            .map(|parameter| &parameter.value)
    }
}

/// Resolves a requester identity to the group of identities treated as equivalent.
pub trait RequesterAliasLookup: Send + Sync {
    /// The full group containing `requester`, or `None` when it is not aliased.
    fn alias_group(&self, requester: &str) -> Option<Vec<String>>;
}

/// Alias groups loaded from configuration. Matching is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfiguredRequesterAliases {
    groups: Vec<Vec<String>>,
}

impl ConfiguredRequesterAliases {
    /// Keeps configured order and drops case-insensitive duplicates inside a group.
    #[must_use]
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        let groups = groups
            .into_iter()
            .map(|group| {
                let mut unique: Vec<String> = Vec::with_capacity(group.len());
                for member in group {
                    let member = member.trim().to_string();
                    if member.is_empty()
                        || unique
                            .iter()
                            .any(|existing| existing.eq_ignore_ascii_case(&member))
                    {
                        continue;
                    }
                    unique.push(member);
                }
                unique
            })
            .filter(|group| !group.is_empty())
            .collect();
        Self { groups }
    }
}

impl RequesterAliasLookup for ConfiguredRequesterAliases {
    fn alias_group(&self, requester: &str) -> Option<Vec<String>> {
        self.groups
            .iter()
            .find(|group| {
                group
                    .iter()
                    .any(|member| member.eq_ignore_ascii_case(requester))
            })
            .cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedTimeRange {
    pub oldest: OffsetDateTime,
    pub newest: Option<OffsetDateTime>,
}

impl CreatedTimeRange {
    #[must_use]
    pub fn since(oldest: OffsetDateTime) -> Self {
        Self {
            oldest,
            newest: None,
        }
    }

    #[must_use]
    pub fn between(oldest: OffsetDateTime, newest: OffsetDateTime) -> Self {
        Self {
            oldest,
            newest: Some(newest),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectTypeFilter {
    Matching(SubjectType),
    Excluding(SubjectType),
}

impl SubjectTypeFilter {
    fn operator(self) -> &'static str {
        match self {
            Self::Matching(_) => "=",
            Self::Excluding(_) => "!=",
        }
    }

    fn subject_type(self) -> SubjectType {
        match self {
            Self::Matching(subject_type) | Self::Excluding(subject_type) => subject_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFilter {
    #[default]
    All,
    ExportsOnly,
    NonExportsOnly,
}

#[derive(Default)]
struct WhereClause {
    text: String,
    parameters: Vec<QueryParameter>,
}

impl WhereClause {
    fn and(&mut self, predicate: &str) {
        if !self.text.is_empty() {
            self.text.push_str(" AND ");
        }
        self.text.push_str(predicate);
    }

    fn bind(&mut self, name: impl Into<String>, value: QueryValue) {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value,
        });
    }

    fn finish(self) -> QuerySpec {
        QuerySpec {
            text: format!("{SELECT_ALL}{}", self.text),
            parameters: self.parameters,
        }
    }
}

/// Builds the subject/requester/command-type history query.
///
/// Predicates appear in the order subject, requester, command type, created time.
#[must_use]
pub fn build_history_query(
    subject: Option<&PrivacySubject>,
    aliases: &dyn RequesterAliasLookup,
    requester: Option<&str>,
    command_types: &[PrivacyCommandType],
    range: CreatedTimeRange,
) -> QuerySpec {
    let mut clause = WhereClause::default();

    match subject {
        Some(PrivacySubject::Msa { puid, .. }) => {
            clause.and("c.s.puid = @puid");
            clause.bind("@puid", QueryValue::Integer(*puid));
        }
        Some(PrivacySubject::Aad { object_id, .. }) => {
            clause.and("c.s.objectId = @objectId");
            clause.bind("@objectId", QueryValue::Text(object_id.to_string()));
        }
        Some(_) | None => {}
    }

    if let Some(requester) = requester {
        match aliases.alias_group(requester) {
            Some(group) if !group.is_empty() => {
                let names = (0..group.len())
                    .map(|index| format!("@requester_{index}"))
                    .collect::<Vec<_>>();
                // The alias predicate carries its own leading space.
                if clause.text.is_empty() {
                    clause.text.push_str(" c.r IN (");
                } else {
                    clause.text.push_str(" AND c.r IN (");
                }
                clause.text.push_str(&names.join(","));
                clause.text.push(')');
                for (name, member) in names.into_iter().zip(group) {
                    clause.bind(name, QueryValue::Text(member));
                }
            }
            _ => {
                clause.and("c.r = @requester");
                clause.bind("@requester", QueryValue::Text(requester.to_string()));
            }
        }
    }

    if !command_types.is_empty() {
        let alternatives = command_types
            .iter()
            .enumerate()
            .map(|(index, command_type)| {
                clause.bind(
                    format!("@commandType{index}"),
                    QueryValue::Integer(command_type.code()),
                );
                format!("c.ct = @commandType{index}")
            })
            .collect::<Vec<_>>();
        clause.and(&format!("({})", alternatives.join(" OR ")));
    }

    match range.newest {
        None => {
            clause.and("c.crt >= @createdTime");
            clause.bind(
                "@createdTime",
                QueryValue::Integer(range.oldest.unix_timestamp()),
            );
        }
        Some(newest) => {
            clause.and("(c.crt BETWEEN @oldestRecord AND @newestRecord)");
            clause.bind(
                "@oldestRecord",
                QueryValue::Integer(range.oldest.unix_timestamp()),
            );
            clause.bind("@newestRecord", QueryValue::Integer(newest.unix_timestamp()));
        }
    }

    clause.finish()
}

/// Builds the replay window scan over `[start, end)`.
///
/// The export exclusion is dropped entirely when `include_exports` is set.
#[must_use]
pub fn build_replay_query(
    start: OffsetDateTime,
    end: OffsetDateTime,
    subject_filter: Option<SubjectTypeFilter>,
    include_exports: bool,
) -> QuerySpec {
    let mut clause = WhereClause::default();
    if !include_exports {
        clause.and(&format!("c.ct != {}", PrivacyCommandType::Export.code()));
    }
    clause.and("c.crt >= @startTime AND c.crt < @endTime");
    clause.bind("@startTime", QueryValue::Integer(start.unix_timestamp()));
    clause.bind("@endTime", QueryValue::Integer(end.unix_timestamp()));

    if let Some(filter) = subject_filter {
        clause.and(&format!("c.s.type {} @subject", filter.operator()));
        clause.bind(
            "@subject",
            QueryValue::Text(filter.subject_type().as_str().to_string()),
        );
    }

    clause.finish()
}

/// Builds the scan for export commands that never reached global completion.
#[must_use]
pub fn build_incomplete_exports_query(
    oldest: OffsetDateTime,
    newest: OffsetDateTime,
    is_aad: bool,
) -> QuerySpec {
    let operator = if is_aad { "=" } else { "!=" };
    QuerySpec {
        text: format!(
            "{SELECT_ALL}c.ct = @commandType AND (c.crt BETWEEN @oldestRecord AND @newestRecord) AND c.c = false AND c.s.type {operator} @subject"
        ),
        parameters: vec![
            QueryParameter {
                name: "@oldestRecord".to_string(),
                value: QueryValue::Integer(oldest.unix_timestamp()),
            },
            QueryParameter {
                name: "@newestRecord".to_string(),
                value: QueryValue::Integer(newest.unix_timestamp()),
            },
            QueryParameter {
                name: "@commandType".to_string(),
                value: QueryValue::Integer(PrivacyCommandType::Export.code()),
            },
            QueryParameter {
                name: "@subject".to_string(),
                value: QueryValue::Text(SubjectType::Aad.as_str().to_string()),
            },
        ],
    }
}

/// Builds the scan for commands whose ingested count lags the total count.
#[must_use]
pub fn build_partially_ingested_query(
    oldest: OffsetDateTime,
    newest: OffsetDateTime,
    filter: ExportFilter,
) -> QuerySpec {
    let mut text = format!(
        "{SELECT_ALL}c.tcc != c.icc AND c.c = false AND (c.crt BETWEEN @oldestRecord AND @newestRecord)"
    );
    let export_code = PrivacyCommandType::Export.code();
    match filter {
        ExportFilter::All => {}
        ExportFilter::ExportsOnly => text.push_str(&format!(" AND c.ct = {export_code}")),
        ExportFilter::NonExportsOnly => text.push_str(&format!(" AND c.ct != {export_code}")),
    }

    QuerySpec {
        text,
        parameters: vec![
            QueryParameter {
                name: "@oldestRecord".to_string(),
                value: QueryValue::Integer(oldest.unix_timestamp()),
            },
            QueryParameter {
                name: "@newestRecord".to_string(),
                value: QueryValue::Integer(newest.unix_timestamp()),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn at(value: &str) -> OffsetDateTime {
        match crate::parse_rfc3339_utc(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    fn fixture_aliases() -> ConfiguredRequesterAliases {
        ConfiguredRequesterAliases::new(vec![vec![
            "foo".to_string(),
            "legacy-caller".to_string(),
        ]])
    }

    fn since() -> CreatedTimeRange {
        CreatedTimeRange::since(at("2026-01-01T00:00:00Z"))
    }

    #[test]
    fn msa_subject_filters_on_puid() {
        let subject = PrivacySubject::Msa {
            puid: 985_154_321,
            anid: None,
        };
        let query = build_history_query(Some(&subject), &fixture_aliases(), None, &[], since());
        assert_eq!(
            query.text,
            "SELECT * FROM c WHERE c.s.puid = @puid AND c.crt >= @createdTime"
        );
        assert_eq!(query.parameter("@puid"), Some(&QueryValue::Integer(985_154_321)));
        assert_eq!(
            query.parameter("@createdTime"),
            Some(&QueryValue::Integer(at("2026-01-01T00:00:00Z").unix_timestamp()))
        );
    }

    #[test]
    fn aad_subject_filters_on_object_id() {
        let object_id = Uuid::new_v4();
        let subject = PrivacySubject::Aad {
            object_id,
            tenant_id: Uuid::new_v4(),
        };
        let query = build_history_query(Some(&subject), &fixture_aliases(), None, &[], since());
        assert_eq!(
            query.text,
            "SELECT * FROM c WHERE c.s.objectId = @objectId AND c.crt >= @createdTime"
        );
        assert_eq!(
            query.parameter("@objectId"),
            Some(&QueryValue::Text(object_id.to_string()))
        );
    }

    #[test]
    fn aliased_requester_expands_to_the_whole_group() {
        let query = build_history_query(None, &fixture_aliases(), Some("FOO"), &[], since());
        assert_eq!(
            query.text,
            "SELECT * FROM c WHERE  c.r IN (@requester_0,@requester_1) AND c.crt >= @createdTime"
        );
        assert_eq!(
            query.parameter("@requester_0"),
            Some(&QueryValue::Text("foo".to_string()))
        );
        assert_eq!(
            query.parameter("@requester_1"),
            Some(&QueryValue::Text("legacy-caller".to_string()))
        );
    }

    #[test]
    fn aliased_requester_after_subject_joins_with_and() {
        let subject = PrivacySubject::Msa { puid: 7, anid: None };
        let query =
            build_history_query(Some(&subject), &fixture_aliases(), Some("foo"), &[], since());
        assert_eq!(
            query.text,
            "SELECT * FROM c WHERE c.s.puid = @puid AND c.r IN (@requester_0,@requester_1) AND c.crt >= @createdTime"
        );
    }

    #[test]
    fn plain_requester_uses_equality() {
        let query = build_history_query(None, &fixture_aliases(), Some("bar"), &[], since());
        assert_eq!(
            query.text,
            "SELECT * FROM c WHERE c.r = @requester AND c.crt >= @createdTime"
        );
        assert_eq!(
            query.parameter("@requester"),
            Some(&QueryValue::Text("bar".to_string()))
        );
    }

    #[test]
    fn command_types_render_as_indexed_alternatives() {
        let two = build_history_query(
            None,
            &fixture_aliases(),
            None,
            &[PrivacyCommandType::Delete, PrivacyCommandType::Export],
            since(),
        );
        assert_eq!(
            two.text,
            "SELECT * FROM c WHERE (c.ct = @commandType0 OR c.ct = @commandType1) AND c.crt >= @createdTime"
        );
        assert_eq!(two.parameter("@commandType1"), Some(&QueryValue::Integer(2)));

        let one = build_history_query(
            None,
            &fixture_aliases(),
            None,
            &[PrivacyCommandType::AccountClose],
            since(),
        );
        assert_eq!(
            one.text,
            "SELECT * FROM c WHERE (c.ct = @commandType0) AND c.crt >= @createdTime"
        );
    }

    #[test]
    fn time_only_query_has_no_dangling_and() {
        let query = build_history_query(None, &fixture_aliases(), None, &[], since());
        assert_eq!(query.text, "SELECT * FROM c WHERE c.crt >= @createdTime");
        assert_eq!(query.parameters.len(), 1);
    }

    #[test]
    fn bounded_range_uses_between() {
        let range = CreatedTimeRange::between(
            at("2026-01-01T00:00:00Z"),
            at("2026-01-02T00:00:00Z"),
        );
        let query = build_history_query(None, &fixture_aliases(), None, &[], range);
        assert_eq!(
            query.text,
            "SELECT * FROM c WHERE (c.crt BETWEEN @oldestRecord AND @newestRecord)"
        );
    }

    #[test]
    fn replay_query_excludes_exports_unless_included() {
        let start = at("2026-01-01T00:00:00Z");
        let end = at("2026-01-02T00:00:00Z");
        let default = build_replay_query(start, end, None, false);
        assert_eq!(
            default.text,
            "SELECT * FROM c WHERE c.ct != 2 AND c.crt >= @startTime AND c.crt < @endTime"
        );
        assert_eq!(
            default.parameter("@endTime"),
            Some(&QueryValue::Integer(end.unix_timestamp()))
        );

        let with_exports = build_replay_query(start, end, None, true);
        assert_eq!(
            with_exports.text,
            "SELECT * FROM c WHERE c.crt >= @startTime AND c.crt < @endTime"
        );
    }

    #[test]
    fn replay_query_appends_subject_type_filter() {
        let start = at("2026-01-01T00:00:00Z");
        let end = at("2026-01-02T00:00:00Z");
        let matching = build_replay_query(
            start,
            end,
            Some(SubjectTypeFilter::Matching(SubjectType::Msa)),
            false,
        );
        assert_eq!(
            matching.text,
            "SELECT * FROM c WHERE c.ct != 2 AND c.crt >= @startTime AND c.crt < @endTime AND c.s.type = @subject"
        );
        assert_eq!(
            matching.parameter("@subject"),
            Some(&QueryValue::Text("msa".to_string()))
        );

        let excluding = build_replay_query(
            start,
            end,
            Some(SubjectTypeFilter::Excluding(SubjectType::Aad)),
            true,
        );
        assert!(excluding.text.ends_with(" AND c.s.type != @subject"));
    }

    #[test]
    fn incomplete_exports_query_matches_fixture() {
        let oldest = at("2026-01-01T00:00:00Z");
        let newest = at("2026-01-31T00:00:00Z");
        let aad = build_incomplete_exports_query(oldest, newest, true);
        assert_eq!(
            aad.text,
            "SELECT * FROM c WHERE c.ct = @commandType AND (c.crt BETWEEN @oldestRecord AND @newestRecord) AND c.c = false AND c.s.type = @subject"
        );
        assert_eq!(aad.parameter("@commandType"), Some(&QueryValue::Integer(2)));
        assert_eq!(
            aad.parameter("@subject"),
            Some(&QueryValue::Text("aad".to_string()))
        );

        let non_aad = build_incomplete_exports_query(oldest, newest, false);
        assert!(non_aad.text.ends_with("AND c.s.type != @subject"));
    }

    #[test]
    fn partially_ingested_query_applies_export_filter() {
        let oldest = at("2026-01-01T00:00:00Z");
        let newest = at("2026-01-31T00:00:00Z");
        let base = "SELECT * FROM c WHERE c.tcc != c.icc AND c.c = false AND (c.crt BETWEEN @oldestRecord AND @newestRecord)";
        assert_eq!(
            build_partially_ingested_query(oldest, newest, ExportFilter::All).text,
            base
        );
        assert_eq!(
            build_partially_ingested_query(oldest, newest, ExportFilter::ExportsOnly).text,
            format!("{base} AND c.ct = 2")
        );
        assert_eq!(
            build_partially_ingested_query(oldest, newest, ExportFilter::NonExportsOnly).text,
            format!("{base} AND c.ct != 2")
        );
    }

    #[test]
    fn alias_groups_dedupe_case_insensitively() {
        let aliases = ConfiguredRequesterAliases::new(vec![
            vec!["A".to_string(), "a".to_string(), " b ".to_string()],
            vec![String::new()],
        ]);
        assert_eq!(
            aliases.alias_group("B"),
            Some(vec!["A".to_string(), "b".to_string()])
        );
        assert_eq!(aliases.alias_group("c"), None);
    }
}
