//! Minimal generic XML tree, shared by the three document loaders in this
//! module. The infrastructure and manifest documents have element names that
//! are themselves data (property names, container names), so a serde-derived
//! struct per document doesn't fit; instead each loader walks a plain tree
//! the way the original implementation walked `xmlNodePtr` children.

use crate::errors::Error;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn text_trimmed(&self) -> &str {
        self.text.trim()
    }

    /// Descendants matching a simple absolute `/a/b/c` path from this element.
    pub fn find_all(&self, path: &[&str]) -> Vec<&Element> {
        match path.split_first() {
            None => vec![self],
            Some((head, rest)) => self
                .children_named(head)
                .flat_map(|child| child.find_all(rest))
                .collect(),
        }
    }
}

pub fn parse(xml: &str) -> Result<Element, Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = vec![Element::default()];
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(tag)) => {
                stack.push(new_element(&tag)?);
            }
            Ok(Event::Empty(tag)) => {
                let element = new_element(&tag)?;
                push_child(&mut stack, element);
            }
            Ok(Event::End(_)) => {
                let finished = stack
                    .pop()
                    .ok_or_else(|| Error::malformed_model("unbalanced XML document"))?;
                push_child(&mut stack, finished);
            }
            Ok(Event::Text(text)) => {
                let decoded = text
                    .unescape()
                    .map_err(|err| Error::malformed_model(format!("invalid XML text: {err}")))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&decoded);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(Error::malformed_model(format!("XML parse error: {err}"))),
        }
        buf.clear();
    }

    let root = stack
        .pop()
        .ok_or_else(|| Error::malformed_model("empty XML document"))?;
    root.children
        .into_iter()
        .next()
        .ok_or_else(|| Error::malformed_model("XML document has no root element"))
}

fn new_element(tag: &quick_xml::events::BytesStart) -> Result<Element, Error> {
    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|err| Error::malformed_model(format!("invalid XML attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| Error::malformed_model(format!("invalid XML attribute value: {err}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        text: String::new(),
        children: Vec::new(),
    })
}

fn push_child(stack: &mut [Element], child: Element) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_with_attributes_and_text() {
        let doc = parse(
            r#"<infrastructure><target name="web1"><numOfCores>4</numOfCores></target></infrastructure>"#,
        )
        .unwrap();
        assert_eq!(doc.name, "infrastructure");
        let target = doc.child("target").unwrap();
        assert_eq!(target.attr("name"), Some("web1"));
        assert_eq!(target.child("numOfCores").unwrap().text_trimmed(), "4");
    }

    #[test]
    fn rejects_empty_document() {
        assert!(parse("").is_err());
    }
}
