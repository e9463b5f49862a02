//! XML bodies of the blob protocol: request documents the client sends and
//! the enumeration/tag documents the service returns.

pub mod deserialize;
pub mod serialize;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// A document that could not be read.
#[derive(Debug, Error)]
#[error("malformed XML: {0}")]
pub struct XmlError(pub String);

/// Escapes special XML characters.
pub fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Streams a document, calling `on_close` for every element as it closes
/// with the element path (root first) and its unescaped text. Container
/// elements see whatever text followed their last child, usually nothing.
pub(crate) fn walk_elements<F>(xml: &str, mut on_close: F) -> Result<(), XmlError>
where
    F: FnMut(&[String], &str) -> Result<(), XmlError>,
{
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                text.clear();
            }
            Ok(Event::Empty(e)) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                on_close(&path, "")?;
                path.pop();
                text.clear();
            }
            Ok(Event::Text(e)) => {
                let unescaped = e.unescape().map_err(|err| XmlError(err.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::CData(e)) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Ok(Event::End(_)) => {
                if path.is_empty() {
                    return Err(XmlError("unbalanced closing tag".to_string()));
                }
                on_close(&path, &text)?;
                path.pop();
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(XmlError(format!(
                    "error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !path.is_empty() {
        return Err(XmlError(format!("document ended inside <{}>", path.join("/"))));
    }
    Ok(())
}

/// Whether `path` ends with the given element names.
pub(crate) fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_reports_paths_and_text() {
        let mut seen = Vec::new();
        walk_elements("<a><b>x &amp; y</b><c/></a>", |path, text| {
            seen.push((path.join("/"), text.to_string()));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("a/b".to_string(), "x & y".to_string()),
                ("a/c".to_string(), String::new()),
                ("a".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn walk_rejects_truncated_documents() {
        assert!(walk_elements("<a><b>x</b>", |_, _| Ok(())).is_err());
    }

    #[test]
    fn escape_round_trips_through_walk() {
        let raw = r#"<&>"'"#;
        let doc = format!("<v>{}</v>", escape(raw));
        let mut got = String::new();
        walk_elements(&doc, |_, text| {
            got = text.to_string();
            Ok(())
        })
        .unwrap();
        assert_eq!(got, raw);
    }
}
