//! `{name}` placeholder templates.
//!
//! Used by the discovery URL/name formats and by resource paths. `{{` and
//! `}}` produce literal braces.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(index) = rest.find(['{', '}']) {
        let (literal, tail) = rest.split_at(index);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if let Some(tail) = tail.strip_prefix("{{") {
            segments.push(Segment::Brace('{'));
            rest = tail;
        } else if let Some(tail) = tail.strip_prefix("}}") {
            segments.push(Segment::Brace('}'));
            rest = tail;
        } else if let Some(tail) = tail.strip_prefix('{') {
            let Some((name, tail)) = tail.split_once('}') else {
                return Err(Error::configuration(format!(
                    "unterminated placeholder in template {template:?}"
                )));
            };
            if name.is_empty() || name.contains('{') {
                return Err(Error::configuration(format!(
                    "invalid placeholder {{{name}}} in template {template:?}"
                )));
            }
            segments.push(Segment::Placeholder(name));
            rest = tail;
        } else {
            return Err(Error::configuration(format!(
                "unmatched '}}' in template {template:?}"
            )));
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Placeholder names of a template, in order of appearance.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the template is malformed.
pub fn placeholders(template: &str) -> Result<Vec<&str>> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Placeholder(name) => Some(name),
            _ => None,
        })
        .collect())
}

/// Substitute every placeholder with the value returned by `lookup`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the template is malformed or uses a
/// placeholder `lookup` does not know.
pub fn render_with(template: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(literal) => rendered.push_str(literal),
            Segment::Brace(brace) => rendered.push(brace),
            Segment::Placeholder(name) => {
                let value = lookup(name).ok_or_else(|| {
                    Error::configuration(format!(
                        "unknown placeholder {{{name}}} in template {template:?}"
                    ))
                })?;
                rendered.push_str(&value);
            }
        }
    }
    Ok(rendered)
}

/// Substitute placeholders from a fixed list of values.
///
/// # Errors
///
/// See [`render_with`].
pub fn render(template: &str, values: &[(&str, &str)]) -> Result<String> {
    render_with(template, |name| {
        values
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| (*value).to_string())
    })
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;

    #[test]
    fn renders_placeholders() {
        let_assert!(
            Ok(url) = render(
                "http://router/{service}-{version}/{version}",
                &[("service", "api"), ("version", "v1")]
            )
        );
        check!(url == "http://router/api-v1/v1");
    }

    #[test]
    fn escaped_braces() {
        let_assert!(Ok(text) = render("{{literal}} {name}", &[("name", "x")]));
        check!(text == "{literal} x");
    }

    #[test]
    fn unknown_placeholder() {
        let_assert!(Err(Error::Configuration(message)) = render("http://{host}", &[]));
        check!(message.contains("{host}"));
    }

    #[test]
    fn malformed_templates() {
        for template in ["http://{host", "http://host}", "{}", "{a{b}"] {
            let_assert!(Err(Error::Configuration(_)) = render(template, &[("a", "1")]));
        }
    }

    #[test]
    fn lists_placeholders() {
        let_assert!(Ok(names) = placeholders("/users/{user_id}/posts/{id}"));
        check!(names == ["user_id", "id"]);
    }
}
