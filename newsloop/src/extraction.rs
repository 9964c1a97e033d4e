//! Template-driven extraction (§4.3.1): maps feed-entry fields and applies
//! content-processing rules and quality filters ahead of persistence.

use serde::Deserialize;

use crate::storage::templates::FeedTemplate;

#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: Option<String>,
}

/// Apply a template's ordered `content_processing_rules` to one field value.
/// Unknown operation types are ignored without error.
pub fn apply_content_rules(mut text: String, rules: &serde_json::Value) -> String {
    let Some(rules) = rules.as_array() else { return text };

    for rule in rules {
        let Some(rule_type) = rule.get("type").and_then(|v| v.as_str()) else { continue };
        match rule_type {
            "html_extract" => {
                let stripped = strip_html_tags(&text);
                let max_len = rule
                    .get("params")
                    .and_then(|p| p.get("max_length"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(u64::MAX) as usize;
                text = truncate_chars(&stripped, max_len);
            }
            "text_normalize" => {
                let sub_rules: Vec<String> = rule
                    .get("params")
                    .and_then(|p| p.get("rules"))
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                for sub in sub_rules {
                    text = match sub.as_str() {
                        "fix_umlauts" => fix_umlauts(&text),
                        "normalize_quotes" => normalize_quotes(&text),
                        _ => text,
                    };
                }
            }
            "remove_tracking" => {
                text = remove_tracking_params(&text);
            }
            _ => {
                // unknown operation type: ignored without error, per §4.3.1
            }
        }
    }
    text
}

#[derive(Debug, Deserialize, Default)]
pub struct QualityFilters {
    pub min_title_length: Option<usize>,
    pub max_title_length: Option<usize>,
}

/// Returns `false` if the fields should be rejected.
pub fn passes_quality_filters(fields: &ExtractedFields, filters_json: &serde_json::Value) -> bool {
    let filters: QualityFilters = serde_json::from_value(filters_json.clone()).unwrap_or_default();
    let title_len = fields.title.chars().count();
    if let Some(min) = filters.min_title_length {
        if title_len < min {
            return false;
        }
    }
    if let Some(max) = filters.max_title_length {
        if title_len > max {
            return false;
        }
    }
    true
}

pub fn strip_html_tags(input: &str) -> String {
    let document = scraper::Html::parse_fragment(input);
    document.root_element().text().collect::<Vec<_>>().join("")
}

fn truncate_chars(input: &str, max_len: usize) -> String {
    input.chars().take(max_len).collect()
}

fn fix_umlauts(input: &str) -> String {
    input
        .replace("ae", "\u{e4}")
        .replace("oe", "\u{f6}")
        .replace("ue", "\u{fc}")
}

fn normalize_quotes(input: &str) -> String {
    input
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

/// Strip `utm_*` query parameters from a URL, leaving the rest intact.
pub fn remove_tracking_params(url: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else { return url.to_string() };
    let filtered: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if filtered.is_empty() {
        parsed.set_query(None);
    } else {
        let query = filtered
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }
    parsed.to_string()
}

/// Read one of the entry's standard attributes by name — the set a
/// template's `field_mappings` can point a logical field at (§4.3.1).
fn resolve_entry_attr(entry: &feed_rs::model::Entry, attr: &str) -> Option<String> {
    match attr {
        "title" => entry.title.as_ref().map(|t| t.content.clone()),
        "summary" | "description" => entry.summary.as_ref().map(|s| s.content.clone()),
        "content" => entry.content.as_ref().and_then(|c| c.body.clone()),
        "link" => entry.links.first().map(|l| l.href.clone()),
        "author" => entry.authors.first().map(|a| a.name.clone()),
        "guid" | "id" => Some(entry.id.clone()),
        "published" => entry.published.map(|d| d.to_rfc3339()),
        _ => None,
    }
    .filter(|s| !s.is_empty())
}

/// Look up a logical field's mapped attribute path in the template, falling
/// back to `default` when unmapped, unknown, or empty.
fn mapped_or_default(
    entry: &feed_rs::model::Entry,
    mappings: &serde_json::Value,
    logical_field: &str,
    default: String,
) -> String {
    mappings
        .get(logical_field)
        .and_then(|v| v.as_str())
        .and_then(|attr| resolve_entry_attr(entry, attr))
        .unwrap_or(default)
}

/// Extract logical fields from a parsed feed entry, using the template's
/// `field_mappings` when present and a sensible default mapping otherwise.
pub fn extract_fields(entry: &feed_rs::model::Entry, template: Option<&FeedTemplate>) -> ExtractedFields {
    let default_title = entry.title.as_ref().map(|t| t.content.clone()).unwrap_or_default();
    let default_link = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
    let default_description = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .unwrap_or_default();
    let default_author = entry.authors.first().map(|a| a.name.clone());

    let mut fields = match template {
        Some(tmpl) => ExtractedFields {
            title: mapped_or_default(entry, &tmpl.field_mappings, "title", default_title),
            link: mapped_or_default(entry, &tmpl.field_mappings, "link", default_link),
            description: mapped_or_default(entry, &tmpl.field_mappings, "description", default_description),
            author: tmpl
                .field_mappings
                .get("author")
                .and_then(|v| v.as_str())
                .and_then(|attr| resolve_entry_attr(entry, attr))
                .or(default_author),
        },
        None => ExtractedFields {
            title: default_title,
            link: default_link,
            description: default_description,
            author: default_author,
        },
    };

    if let Some(tmpl) = template {
        fields.description = apply_content_rules(fields.description, &tmpl.content_processing_rules);
        fields.link = remove_tracking_params(&fields.link);
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_truncates() {
        let rules = serde_json::json!([{"type": "html_extract", "params": {"max_length": 5}}]);
        let out = apply_content_rules("<p>Hello world</p>".to_string(), &rules);
        assert_eq!(out, "Hello");
    }

    #[test]
    fn removes_utm_params_only() {
        let url = "https://example.com/a?utm_source=x&id=5";
        let cleaned = remove_tracking_params(url);
        assert!(cleaned.contains("id=5"));
        assert!(!cleaned.contains("utm_source"));
    }

    #[test]
    fn unknown_rule_type_is_ignored() {
        let rules = serde_json::json!([{"type": "mystery", "params": {}}]);
        let out = apply_content_rules("unchanged".to_string(), &rules);
        assert_eq!(out, "unchanged");
    }

    #[test]
    fn mapped_or_default_falls_back_when_attr_unknown() {
        let entry = feed_rs::model::Entry::default();
        let mappings = serde_json::json!({"title": "nonsense_attr"});
        let out = mapped_or_default(&entry, &mappings, "title", "fallback".to_string());
        assert_eq!(out, "fallback");
    }

    #[test]
    fn resolve_entry_attr_reads_guid() {
        let mut entry = feed_rs::model::Entry::default();
        entry.id = "urn:guid:123".to_string();
        assert_eq!(resolve_entry_attr(&entry, "guid").as_deref(), Some("urn:guid:123"));
    }

    #[test]
    fn quality_filters_reject_short_titles() {
        let fields = ExtractedFields { title: "Hi".to_string(), ..Default::default() };
        let filters = serde_json::json!({"min_title_length": 5});
        assert!(!passes_quality_filters(&fields, &filters));
    }
}
