//! Wire and domain types shared by the ingestion pipeline.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// The kind of Sonar result a query or fragment refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "bugs")]
    Bugs,
    #[serde(rename = "codeSmells")]
    CodeSmells,
    #[serde(rename = "vulnerabilities")]
    Vulnerabilities,
    #[serde(rename = "coverage")]
    Coverage,
    #[serde(rename = "duplications")]
    Duplications,
}

impl Category {
    /// Categories that carry flat issue lists and map to tickets.
    pub const FLAT: [Category; 3] = [
        Category::Bugs,
        Category::CodeSmells,
        Category::Vulnerabilities,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Category::Bugs => "bugs",
            Category::CodeSmells => "codeSmells",
            Category::Vulnerabilities => "vulnerabilities",
            Category::Coverage => "coverage",
            Category::Duplications => "duplications",
        }
    }

    pub const fn is_tree(&self) -> bool {
        matches!(self, Category::Coverage | Category::Duplications)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the per-commit query endpoint was asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueQueryType {
    Statistics,
    Issues(Category),
}

impl std::str::FromStr for IssueQueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let query = match s {
            "issuesStatistics" => IssueQueryType::Statistics,
            "bugs" => IssueQueryType::Issues(Category::Bugs),
            "codeSmells" => IssueQueryType::Issues(Category::CodeSmells),
            "vulnerabilities" => IssueQueryType::Issues(Category::Vulnerabilities),
            "coverage" => IssueQueryType::Issues(Category::Coverage),
            "duplications" => IssueQueryType::Issues(Category::Duplications),
            other => return Err(other.to_string()),
        };
        Ok(query)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRange {
    #[serde(default)]
    pub start_line: i64,
    #[serde(default)]
    pub end_line: i64,
    #[serde(default)]
    pub start_offset: i64,
    #[serde(default)]
    pub end_offset: i64,
}

/// A single bug, code smell or vulnerability reported by the scanner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub code: Vec<String>,
    #[serde(default)]
    pub text_range: TextRange,
}

/// Identity of an issue across two scans. `line` is left out because it is
/// carried by `text_range.start_line`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IssueKey {
    pub path: String,
    pub rule: String,
    pub message: String,
    pub text_range: TextRange,
}

impl Issue {
    pub fn key(&self) -> IssueKey {
        IssueKey {
            path: self.path.clone(),
            rule: self.rule.clone(),
            message: self.message.clone(),
            text_range: self.text_range,
        }
    }
}

/// A node of the coverage or duplication tree. Members other than the
/// structural ones are kept as they were reported.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTree {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<IssueTree>,
    #[serde(flatten)]
    pub measures: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    #[serde(default, deserialize_with = "string_or_number")]
    pub bugs: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code_smells: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub vulnerabilities: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub coverage: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub duplications: String,
}

/// Summary statistics as reported by one scan and as returned to readers.
/// Numeric members stay strings on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueStatistics {
    #[serde(default, deserialize_with = "string_or_number")]
    pub bugs: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code_smells: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub vulnerabilities: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub coverage: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub duplications: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ut: String,
    #[serde(default)]
    pub rating: Option<Rating>,
    #[serde(default)]
    pub sonar_key: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Body of `POST /sonar-results-store`.
///
/// Result fragments are kept as raw JSON so that one malformed fragment can be
/// dropped without rejecting the rest of the scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPayload {
    pub key: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub git_repo: String,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub application_id: i64,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub build_id: i64,
    #[serde(default)]
    pub operator_id: String,
    #[serde(default)]
    pub log_id: String,
    #[serde(default)]
    pub issues_statistics: Option<serde_json::Value>,
    #[serde(default)]
    pub bugs: Option<serde_json::Value>,
    #[serde(default)]
    pub code_smells: Option<serde_json::Value>,
    #[serde(default)]
    pub vulnerabilities: Option<serde_json::Value>,
    #[serde(default)]
    pub coverage: Option<serde_json::Value>,
    #[serde(default)]
    pub duplications: Option<serde_json::Value>,
}

impl ScanPayload {
    pub fn fragment(&self, category: Category) -> Option<&serde_json::Value> {
        match category {
            Category::Bugs => self.bugs.as_ref(),
            Category::CodeSmells => self.code_smells.as_ref(),
            Category::Vulnerabilities => self.vulnerabilities.as_ref(),
            Category::Coverage => self.coverage.as_ref(),
            Category::Duplications => self.duplications.as_ref(),
        }
    }

    /// Decodes the flat issue list for `category`. An absent or null
    /// fragment is an empty list.
    pub fn issues(&self, category: Category) -> Result<Vec<Issue>, serde_json::Error> {
        match self.fragment(category) {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(value) => Vec::<Issue>::deserialize(value),
        }
    }

    /// Decodes the reported statistics. An absent fragment decodes to the
    /// default (all fields empty).
    pub fn statistics(&self) -> Result<IssueStatistics, serde_json::Error> {
        match &self.issues_statistics {
            None | Some(serde_json::Value::Null) => Ok(IssueStatistics::default()),
            Some(value) => IssueStatistics::deserialize(value),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Text(String),
        Number(serde_json::Number),
        Nothing(()),
    }

    Ok(match Loose::deserialize(deserializer)? {
        Loose::Text(s) => s,
        Loose::Number(n) => n.to_string(),
        Loose::Nothing(()) => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_type_parsing() {
        assert_eq!(
            "issuesStatistics".parse::<IssueQueryType>(),
            Ok(IssueQueryType::Statistics)
        );
        assert_eq!(
            "codeSmells".parse::<IssueQueryType>(),
            Ok(IssueQueryType::Issues(Category::CodeSmells))
        );
        assert_eq!(
            "duplications".parse::<IssueQueryType>(),
            Ok(IssueQueryType::Issues(Category::Duplications))
        );
        assert_eq!(
            "smells".parse::<IssueQueryType>(),
            Err("smells".to_string())
        );
    }

    #[test]
    fn test_statistics_accept_numbers_and_strings() {
        let stats: IssueStatistics = serde_json::from_value(json!({
            "bugs": 3,
            "codeSmells": "12",
            "coverage": 45.5,
            "duplications": null,
        }))
        .unwrap();

        assert_eq!(stats.bugs, "3");
        assert_eq!(stats.code_smells, "12");
        assert_eq!(stats.coverage, "45.5");
        assert_eq!(stats.duplications, "");
        assert_eq!(stats.vulnerabilities, "");
    }

    #[test]
    fn test_issue_key_ignores_severity_and_status() {
        let a = Issue {
            path: "src/main.go".into(),
            message: "nil dereference".into(),
            rule: "go:S1".into(),
            severity: "MAJOR".into(),
            status: "OPEN".into(),
            line: 10,
            text_range: TextRange {
                start_line: 10,
                end_line: 10,
                start_offset: 2,
                end_offset: 9,
            },
            ..Default::default()
        };
        let mut b = a.clone();
        b.severity = "MINOR".into();
        b.status = "CONFIRMED".into();
        assert_eq!(a.key(), b.key());

        b.text_range.end_offset = 10;
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_issue_tree_keeps_unknown_members() {
        let value = json!([{
            "path": "src",
            "name": "src",
            "coverage": "81.2",
            "children": [{"path": "src/a.go", "name": "a.go", "lines": 40}]
        }]);
        let trees: Vec<IssueTree> = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(trees[0].children.len(), 1);
        assert_eq!(trees[0].measures["coverage"], json!("81.2"));
        assert_eq!(serde_json::to_value(&trees).unwrap(), value);
    }

    #[test]
    fn test_payload_issue_decoding() {
        let payload: ScanPayload = serde_json::from_value(json!({
            "key": "scan-1",
            "commitId": "c1",
            "bugs": [{"path": "a.go", "message": "m", "rule": "r", "line": 3}],
            "codeSmells": null,
            "vulnerabilities": "not a list",
        }))
        .unwrap();

        assert_eq!(payload.issues(Category::Bugs).unwrap().len(), 1);
        assert!(payload.issues(Category::CodeSmells).unwrap().is_empty());
        assert!(payload.issues(Category::Vulnerabilities).is_err());
        assert_eq!(payload.statistics().unwrap(), IssueStatistics::default());
    }
}
