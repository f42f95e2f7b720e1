//! Sanitising of user-supplied names into storage-safe path segments.

use chrono::Utc;

/// Characters replaced with `_` inside relative path segments.
const PATH_SEGMENT_BAD_CHARS: [char; 7] = [':', '|', '*', '?', '"', '<', '>'];

const OCTET_STREAM: &str = "application/octet-stream";

fn is_plain(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Split `name` into stem and extension (extension without the dot).
/// A leading dot does not start an extension.
pub fn split_stem_ext(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < name.len() => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}

/// Make an uploaded filename safe to use as the last segment of an object key.
///
/// The stem keeps alphanumerics, `-` and `_` (everything else becomes `_`);
/// the extension keeps only alphanumerics.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = split_stem_ext(base);

    let mut sane_stem: String = stem
        .chars()
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    if sane_stem.is_empty() {
        sane_stem = format!("upload_{}", Utc::now().format("%Y%m%d%H%M%S%6f"));
    }

    let sane_ext: String = ext
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();

    if sane_ext.is_empty() {
        sane_stem
    } else {
        format!("{}.{}", sane_stem, sane_ext)
    }
}

/// Storage segment for a project id. Never empty.
pub fn project_segment(project: &str) -> String {
    let sane: String = project
        .trim()
        .chars()
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    let sane = sane.trim_matches('_');
    if sane.is_empty() {
        "unknown".to_string()
    } else {
        sane.to_string()
    }
}

/// Storage segment for a folder display name. Never empty.
pub fn name_segment(name: &str) -> String {
    let sane: String = name
        .trim()
        .chars()
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    let sane = sane.trim_matches('_');
    if sane.is_empty() {
        "folder".to_string()
    } else {
        sane.to_string()
    }
}

/// Sanitize one segment of a relative path, or `None` if the segment is
/// hidden, empty, `.` or `..`.
fn sanitize_path_segment(seg: &str) -> Option<String> {
    let replaced: String = seg
        .trim()
        .chars()
        .map(|c| if PATH_SEGMENT_BAD_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.starts_with('.') {
        return None;
    }
    Some(collapsed)
}

/// Sanitize a relative path from an uploaded archive, preserving hierarchy.
/// Returns `None` when any segment is disallowed.
pub fn sanitize_relative_path(relpath: &str) -> Option<String> {
    let normalized = relpath.replace('\\', "/");
    let segments = normalized
        .trim_matches('/')
        .split('/')
        .map(sanitize_path_segment)
        .collect::<Option<Vec<_>>>()?;
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

/// Archive entries that are operating-system litter rather than data.
pub fn is_system_artifact(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    normalized
        .split('/')
        .any(|seg| seg == "__MACOSX" || seg == ".DS_Store")
}

/// Upper-cased extension without the dot, or `UNKNOWN`.
pub fn file_extension(filename: &str) -> String {
    match split_stem_ext(filename).1 {
        Some(ext) => ext.to_uppercase(),
        None => "UNKNOWN".to_string(),
    }
}

/// Content type declared by the client, else guessed from the filename.
/// A declared `application/octet-stream` says nothing and is ignored.
pub fn content_type_for(filename: &str, declared: Option<&str>) -> String {
    declared
        .map(str::trim)
        .filter(|ct| !ct.is_empty() && !ct.eq_ignore_ascii_case(OCTET_STREAM))
        .map(str::to_string)
        .unwrap_or_else(|| {
            mime_guess::from_path(filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
}

/// Case-folded copy of a searchable value. SQLite only folds ASCII, so
/// search columns are stored pre-folded and compared byte for byte.
pub fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

/// Case-folded JSON text of a tag list, as matched by tag search.
pub fn fold_tags(tags: &[String]) -> String {
    fold_case(&serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string()))
}

/// `value` escaped the way it appears inside a JSON string literal, so it can
/// be matched against serialized tag lists.
pub fn json_escaped(value: &str) -> String {
    let quoted = serde_json::to_string(value).unwrap_or_default();
    quoted
        .strip_prefix('"')
        .and_then(|q| q.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}
