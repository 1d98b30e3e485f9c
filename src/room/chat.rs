//! Chat message sanitization.
//!
//! Clients submit a structured message tree (`{t, a, c}` nodes); it is
//! rendered into HTML through a strict whitelist before being persisted
//! and broadcast.

use serde_json::Value;

fn is_allowed_tag(tag: &str) -> bool {
    // Strictly check tag names to disallow injection. Client-side
    // canonical tag names are upper case.
    if tag.eq_ignore_ascii_case("SCRIPT")
        || tag.eq_ignore_ascii_case("STYLE")
        || tag.eq_ignore_ascii_case("IFRAME")
    {
        return false;
    }
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

fn is_allowed_attr(attr: &str, value: &str) -> bool {
    // target=_blank is added explicitly for anchors.
    let lower = attr.to_ascii_lowercase();
    if lower.starts_with("on") || lower == "class" || lower == "target" {
        return false;
    }
    if lower == "href" {
        let value = value.to_ascii_lowercase();
        return value.starts_with("http://") || value.starts_with("https://");
    }
    !attr.is_empty() && attr.chars().all(|c| c.is_ascii_alphabetic())
}

fn is_self_closing(tag: &str) -> bool {
    tag.eq_ignore_ascii_case("IMG")
        || tag.eq_ignore_ascii_case("HR")
        || tag.eq_ignore_ascii_case("BR")
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

fn render(out: &mut String, node: &Value) {
    match node {
        Value::Array(children) => {
            for child in children {
                render(out, child);
            }
        }
        Value::String(text) => {
            escape_text(out, text);
        }
        Value::Object(map) => {
            let tag = match map.get("t").and_then(Value::as_str) {
                Some(tag) if is_allowed_tag(tag) => tag,
                // A disallowed element disappears with all its children.
                _ => return,
            };
            let attrs = map.get("a").and_then(Value::as_object);
            let children = map
                .get("c")
                .and_then(Value::as_array)
                .filter(|children| !children.is_empty());

            out.push('<');
            out.push_str(tag);

            if tag.eq_ignore_ascii_case("A") {
                out.push_str(" target=_blank");
            }

            if let Some(attrs) = attrs {
                for (name, value) in attrs {
                    if let Value::String(value) = value {
                        if is_allowed_attr(name, value) {
                            out.push(' ');
                            out.push_str(name);
                            if !value.is_empty() {
                                out.push_str("=\"");
                                escape_attr(out, value);
                                out.push('"');
                            }
                        }
                    }
                }
            }

            if children.is_some() || !is_self_closing(tag) {
                out.push('>');
                if let Some(children) = children {
                    for child in children {
                        render(out, child);
                    }
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            } else {
                out.push_str("/>");
            }
        }
        _ => {}
    }
}

/// Renders a client message tree into safe HTML.
pub fn sanitize_message(message: &Value) -> String {
    let mut out = String::new();
    render(&mut out, message);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_dropped_javascript_stripped_target_forced() {
        let tree = json!([
            {"t": "SCRIPT", "c": ["alert(1)"]},
            {"t": "A", "a": {"href": "javascript:1"}, "c": ["x"]},
            {"t": "A", "a": {"href": "https://e.com"}, "c": ["ok"]},
        ]);
        assert_eq!(
            sanitize_message(&tree),
            "<A target=_blank>x</A><A target=_blank href=\"https://e.com\">ok</A>",
        );
    }

    #[test]
    fn text_is_escaped_and_event_attrs_dropped() {
        let tree = json!([
            {"t": "B", "a": {"onclick": "evil()", "style": "color: red"}, "c": ["a <b> & c"]},
        ]);
        assert_eq!(
            sanitize_message(&tree),
            "<B style=\"color: red\">a &lt;b&gt; &amp; c</B>",
        );
    }

    #[test]
    fn lowercase_and_unknown_tags_are_dropped() {
        let tree = json!([
            {"t": "em", "c": ["nope"]},
            {"t": "IFRAME", "a": {"src": "https://e.com"}},
            {"t": "BR"},
        ]);
        assert_eq!(sanitize_message(&tree), "<BR/>");
    }

    #[test]
    fn attribute_values_are_escaped() {
        let tree = json!([
            {"t": "SPAN", "a": {"title": "say \"hi\""}, "c": ["x"]},
        ]);
        assert_eq!(
            sanitize_message(&tree),
            "<SPAN title=\"say &quot;hi&quot;\">x</SPAN>",
        );
    }

    #[test]
    fn sanitization_is_deterministic_and_stable() {
        let tree = json!([
            {"t": "DIV", "c": [{"t": "A", "a": {"href": "https://e.com"}, "c": ["link"]}]},
        ]);
        let first = sanitize_message(&tree);
        let second = sanitize_message(&tree);
        assert_eq!(first, second);
    }
}
