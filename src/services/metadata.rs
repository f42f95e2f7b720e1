//! Validation of the YAML sidecar that accompanies every upload.
//!
//! Required: `research_project_id` (alias `project`) and `author`.
//! Optional: `experiment_type`, `date_conducted` (ISO date), `custom_tags` /
//! `tags`, `notes`, and in folder mode a display `name`.

use chrono::NaiveDate;
use serde_yaml_ng::Value;

use super::error::ValidationError;
use crate::models::file_record::MetadataSnapshot;

/// Which upload surface the metadata arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    SingleFile,
    Folder,
}

/// Validated upload metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub project: String,
    pub author: String,
    pub experiment_type: Option<String>,
    pub date_conducted: Option<NaiveDate>,
    /// Lower-cased, de-duplicated, in first-seen order.
    pub tags: Vec<String>,
    pub notes: Option<String>,
    /// Folder display name; only read in folder mode.
    pub name: Option<String>,
}

impl UploadMetadata {
    /// The descriptive fields copied onto a standalone file row.
    pub fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            project: self.project.clone(),
            author: self.author.clone(),
            experiment_type: self.experiment_type.clone(),
            date_conducted: self.date_conducted,
            tags: self.tags.clone(),
        }
    }
}

/// Parse and validate a raw YAML metadata document.
///
/// Every missing or malformed field is reported in one `ValidationError`.
pub fn parse_metadata(raw: &[u8], mode: UploadMode) -> Result<UploadMetadata, ValidationError> {
    let doc: Value = serde_yaml_ng::from_slice(raw)
        .map_err(|err| ValidationError::new(format!("Invalid metadata YAML: {}", err)))?;
    if !doc.is_mapping() {
        return Err(ValidationError::new(
            "Invalid metadata YAML: content must be a mapping",
        ));
    }

    let mut issues = Vec::new();
    let mut field = |key: &str| -> Option<String> {
        match scalar_string(doc.get(key)) {
            Ok(value) => value,
            Err(()) => {
                issues.push(format!("'{}' must be a single value", key));
                None
            }
        }
    };

    let project = field("project").or_else(|| field("research_project_id"));
    let author = field("author");
    let experiment_type = field("experiment_type");
    let date_raw = field("date_conducted");
    let notes = field("notes");
    let custom_tags = field("custom_tags");
    let name = match mode {
        UploadMode::Folder => field("name"),
        UploadMode::SingleFile => None,
    };

    if project.is_none() {
        issues.push("missing required field 'research_project_id' (or 'project')".to_string());
    }
    if author.is_none() {
        issues.push("missing required field 'author'".to_string());
    }

    let date_conducted = match date_raw {
        Some(raw) => match parse_iso_date("date_conducted", &raw) {
            Ok(date) => Some(date),
            Err(issue) => {
                issues.push(issue);
                None
            }
        },
        None => None,
    };

    let mut raw_tags: Vec<String> = custom_tags.map(|s| split_tags(&s)).unwrap_or_default();
    match doc.get("tags") {
        None | Some(Value::Null) => {}
        Some(Value::Sequence(items)) => {
            for item in items {
                match scalar_string(Some(item)) {
                    Ok(Some(tag)) => raw_tags.push(tag),
                    Ok(None) => {}
                    Err(()) => issues.push("'tags' entries must be plain values".to_string()),
                }
            }
        }
        Some(other) => match scalar_string(Some(other)) {
            Ok(Some(s)) => raw_tags.extend(split_tags(&s)),
            Ok(None) => {}
            Err(()) => issues.push("'tags' must be a list or a comma-separated string".to_string()),
        },
    }

    match (project, author) {
        (Some(project), Some(author)) if issues.is_empty() => Ok(UploadMetadata {
            project,
            author,
            experiment_type,
            date_conducted,
            tags: normalize_tags(raw_tags),
            notes,
            name,
        }),
        _ => Err(ValidationError::from_issues(issues)),
    }
}

/// Parse `YYYY-MM-DD`, naming `field` in the error.
pub fn parse_iso_date(field: &str, raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        format!(
            "'{}' must be an ISO date (YYYY-MM-DD), got '{}'",
            field, raw
        )
    })
}

/// Split a comma-separated tag string, dropping empty segments.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercase and de-duplicate, keeping first-seen order.
pub fn normalize_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Render a YAML scalar as a trimmed string. `Ok(None)` for absent, null or
/// blank values; `Err` for sequences and mappings.
fn scalar_string(value: Option<&Value>) -> Result<Option<String>, ()> {
    let rendered = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Tagged(tagged)) => return scalar_string(Some(&tagged.value)),
        Some(Value::Sequence(_)) | Some(Value::Mapping(_)) => return Err(()),
    };
    Ok((!rendered.is_empty()).then_some(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_single_file_metadata() {
        let meta = parse_metadata(b"research_project_id: FS1\nauthor: ana\n", UploadMode::SingleFile)
            .unwrap();
        assert_eq!(meta.project, "FS1");
        assert_eq!(meta.author, "ana");
        assert_eq!(meta.experiment_type, None);
        assert_eq!(meta.date_conducted, None);
        assert!(meta.tags.is_empty());
    }

    #[test]
    fn full_metadata_with_tags_and_date() {
        let yaml = br#"
project: Mouse-Imaging
research_project_id: ignored
author: Dana
experiment_type: Two-Photon
date_conducted: 2024-03-09
custom_tags: " Cortex, ,GCaMP,cortex "
tags: [awake, GCaMP]
notes: first session
name: Session 1
"#;
        let meta = parse_metadata(yaml, UploadMode::Folder).unwrap();
        assert_eq!(meta.project, "Mouse-Imaging");
        assert_eq!(meta.date_conducted, NaiveDate::from_ymd_opt(2024, 3, 9));
        assert_eq!(meta.tags, vec!["cortex", "gcamp", "awake"]);
        assert_eq!(meta.notes.as_deref(), Some("first session"));
        assert_eq!(meta.name.as_deref(), Some("Session 1"));
    }

    #[test]
    fn name_is_ignored_for_single_files() {
        let meta = parse_metadata(
            b"project: P\nauthor: a\nname: ignored\n",
            UploadMode::SingleFile,
        )
        .unwrap();
        assert_eq!(meta.name, None);
    }

    #[test]
    fn numeric_project_ids_are_accepted() {
        let meta = parse_metadata(b"research_project_id: 42\nauthor: bo\n", UploadMode::SingleFile)
            .unwrap();
        assert_eq!(meta.project, "42");
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let err = parse_metadata(b"experiment_type: ephys\n", UploadMode::SingleFile).unwrap_err();
        assert!(err.mentions("research_project_id"));
        assert!(err.mentions("author"));
        assert_eq!(err.issues.len(), 2);
    }

    #[test]
    fn blank_author_counts_as_missing() {
        let err = parse_metadata(b"project: P\nauthor: '  '\n", UploadMode::SingleFile).unwrap_err();
        assert!(err.mentions("author"));
    }

    #[test]
    fn bad_date_is_rejected() {
        let err = parse_metadata(
            b"project: P\nauthor: a\ndate_conducted: 09/03/2024\n",
            UploadMode::SingleFile,
        )
        .unwrap_err();
        assert!(err.mentions("date_conducted"));
    }

    #[test]
    fn non_mapping_documents_are_rejected() {
        assert!(parse_metadata(b"- a\n- b\n", UploadMode::SingleFile).is_err());
        assert!(parse_metadata(b"", UploadMode::SingleFile).is_err());
        assert!(parse_metadata(b"author: [unclosed", UploadMode::SingleFile).is_err());
    }

    #[test]
    fn structured_author_is_malformed() {
        let err = parse_metadata(b"project: P\nauthor: {first: a}\n", UploadMode::SingleFile)
            .unwrap_err();
        assert!(err.mentions("'author' must be a single value"));
    }
}
