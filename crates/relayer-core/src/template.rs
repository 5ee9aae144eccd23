//! Template Engine: a pure renderer, `(template, variables) -> caption`.

use std::collections::HashMap;

use crate::model::{MediaKind, Message};

/// Default forward template when the caller supplies none.
pub const DEFAULT_TEMPLATE: &str = "{original_text}{original_caption}";

/// Length of a logging preview produced alongside the rendered caption.
const PREVIEW_LEN: usize = 80;

/// Result of rendering and, if needed, truncating a caption to a
/// per-session cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCaption {
    pub caption: String,
    pub truncated: bool,
    pub preview: String,
}

/// Build the variable map for a single source [`Message`] per the caption
/// template's documented placeholders.
pub fn variables_for(message: &Message, source_channel_name: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert(
        "original_text".to_string(),
        message.text.clone().unwrap_or_default(),
    );
    vars.insert(
        "original_caption".to_string(),
        message.caption.clone().unwrap_or_default(),
    );
    vars.insert(
        "file_name".to_string(),
        message.file_name.clone().unwrap_or_default(),
    );
    vars.insert("file_size".to_string(), format_bytes(message.file_size));
    vars.insert("source_channel".to_string(), source_channel_name.to_string());
    vars.insert(
        "timestamp".to_string(),
        message.author_date.to_rfc3339(),
    );
    vars.insert("media_kind".to_string(), media_kind_label(message.media_kind).to_string());
    vars
}

/// Replace all `{name}` placeholders in `template` with values from
/// `variables`; an unresolved placeholder collapses to the empty string.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '{' {
            result.push(ch);
            continue;
        }
        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        if closed {
            if let Some(value) = variables.get(&name) {
                result.push_str(value);
            }
            // Unknown placeholders reduce to empty — nothing pushed.
        } else {
            result.push('{');
            result.push_str(&name);
        }
    }

    result
}

/// Render `template` against `message`'s variables, then truncate to `cap`
/// at a word boundary if the rendered caption exceeds it.
pub fn render_caption(template: &str, message: &Message, source_channel_name: &str, cap: usize) -> RenderedCaption {
    let vars = variables_for(message, source_channel_name);
    let rendered = render(template, &vars);
    let preview = make_preview(&rendered);

    if rendered.chars().count() <= cap {
        return RenderedCaption {
            caption: rendered,
            truncated: false,
            preview,
        };
    }

    let truncated = truncate_at_word_boundary(&rendered, cap);
    RenderedCaption {
        caption: truncated,
        truncated: true,
        preview,
    }
}

fn truncate_at_word_boundary(s: &str, cap: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= cap {
        return s.to_string();
    }
    let mut cut = cap;
    while cut > 0 && !chars[cut - 1].is_whitespace() && !chars[cut].is_whitespace() {
        cut -= 1;
    }
    if cut == 0 {
        cut = cap;
    }
    chars[..cut].iter().collect::<String>().trim_end().to_string()
}

fn make_preview(s: &str) -> String {
    if s.chars().count() <= PREVIEW_LEN {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(PREVIEW_LEN).collect();
        format!("{truncated}…")
    }
}

fn media_kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "photo",
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        MediaKind::Voice => "voice",
        MediaKind::VideoNote => "video note",
        MediaKind::Animation => "animation",
        MediaKind::Document => "document",
        MediaKind::None => "text",
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1024.0 && unit_idx < UNITS.len() - 1 {
        value /= 1024.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: Option<&str>, caption: Option<&str>) -> Message {
        Message {
            channel_id: 1,
            message_id: 100,
            author_date: chrono::Utc::now(),
            text: text.map(|s| s.to_string()),
            caption: caption.map(|s| s.to_string()),
            media_payload_ref: None,
            group_id: None,
            media_kind: MediaKind::Photo,
            file_size: 2048,
            file_name: Some("holiday.jpg".to_string()),
        }
    }

    #[test]
    fn render_substitutes_known_placeholder() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "world".to_string());
        assert_eq!(render("hello {name}", &vars), "hello world");
    }

    #[test]
    fn render_unknown_placeholder_collapses_to_empty() {
        let vars = HashMap::new();
        assert_eq!(render("a{missing}b", &vars), "ab");
    }

    #[test]
    fn render_with_no_placeholders_is_unchanged() {
        let vars = HashMap::new();
        assert_eq!(render("plain text", &vars), "plain text");
    }

    #[test]
    fn default_template_concatenates_text_and_caption() {
        let message = msg(Some("look at this"), Some("my caption"));
        let rendered = render_caption(DEFAULT_TEMPLATE, &message, "@src", 1024);
        assert_eq!(rendered.caption, "look at thismy caption");
        assert!(!rendered.truncated);
    }

    #[test]
    fn caption_exceeding_cap_is_truncated_and_flagged() {
        let long_caption = "word ".repeat(50);
        let message = msg(None, Some(&long_caption));
        let rendered = render_caption("{original_caption}", &message, "@src", 20);
        assert!(rendered.truncated);
        assert!(rendered.caption.chars().count() <= 20);
        assert!(!rendered.caption.ends_with(' '));
    }

    #[test]
    fn preview_is_capped_and_marked_with_ellipsis() {
        let long_caption = "x".repeat(200);
        let message = msg(None, Some(&long_caption));
        let rendered = render_caption("{original_caption}", &message, "@src", 1024);
        assert!(rendered.preview.ends_with('…'));
        assert!(rendered.preview.chars().count() <= PREVIEW_LEN + 1);
    }

    #[test]
    fn variables_include_file_size_and_channel() {
        let message = msg(None, None);
        let vars = variables_for(&message, "@source_chan");
        assert_eq!(vars.get("source_channel").unwrap(), "@source_chan");
        assert_eq!(vars.get("file_size").unwrap(), "2.0 KiB");
        assert_eq!(vars.get("file_name").unwrap(), "holiday.jpg");
    }
}
