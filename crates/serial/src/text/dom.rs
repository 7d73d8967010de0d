//! Minimal XML document tree.
//!
//! The text writers build this tree and pretty-print it in one go; the
//! reader parses the whole document into it before any typed decoding
//! starts. Rendering is strict and canonical, parsing is liberal in
//! whitespace and strict in tag structure.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::context::PrintFlags;
use crate::error::SerialError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
    /// 1-based source line, for error reports.
    pub line: u64,
}

impl XmlNode {
    pub fn new(name: &str) -> XmlNode {
        XmlNode {
            name: name.to_string(),
            ..XmlNode::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.attrs.push((name.to_string(), value.to_string()));
    }
}

/// Renders `root` to text, honouring the print flags.
pub fn render(root: &XmlNode, flags: PrintFlags) -> Result<String, SerialError> {
    let mut writer = if flags.indent {
        Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2)
    } else {
        Writer::new(Cursor::new(Vec::new()))
    };

    if !flags.no_header {
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(|e| SerialError::TextParse(format!("XML write error: {e}")))?;
    }
    render_node(&mut writer, root)?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes)
        .map_err(|e| SerialError::TextParse(format!("renderer produced invalid UTF-8: {e}")))
}

fn render_node(writer: &mut Writer<Cursor<Vec<u8>>>, node: &XmlNode) -> Result<(), SerialError> {
    let write_error = |e| SerialError::TextParse(format!("XML write error: {e}"));

    let mut start = BytesStart::new(node.name.as_str());
    for (name, value) in &node.attrs {
        start.push_attribute((name.as_str(), value.as_str()));
    }

    if node.children.is_empty() && node.text.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(write_error)?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(write_error)?;
    if !node.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&node.text)))
            .map_err(write_error)?;
    }
    for child in &node.children {
        render_node(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(node.name.as_str())))
        .map_err(write_error)?;
    Ok(())
}

/// Parses a document into a tree. Whitespace-only text is dropped, other
/// text is trimmed.
pub fn parse(text: &str) -> Result<XmlNode, SerialError> {
    let mut reader = Reader::from_str(text);

    let line_at = |position: usize| -> u64 {
        text.as_bytes()[..position.min(text.len())]
            .iter()
            .filter(|&&b| b == b'\n')
            .count() as u64
            + 1
    };

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let position = reader.buffer_position();
        match reader
            .read_event()
            .map_err(|e| SerialError::TextParse(format!("XML error at line {}: {e}", line_at(position))))?
        {
            Event::Start(start) => {
                let node = start_to_node(&start, line_at(position))?;
                stack.push(node);
            }
            Event::Empty(start) => {
                let node = start_to_node(&start, line_at(position))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(text_event) => {
                let value = text_event
                    .unescape()
                    .map_err(|e| SerialError::TextParse(format!("bad text content: {e}")))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(value.trim());
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| SerialError::TextParse("unbalanced closing tag".into()))?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Eof => break,
            // declarations, comments and processing instructions carry no
            // value content
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(SerialError::TextParse("unterminated element".into()));
    }
    root.ok_or_else(|| SerialError::TextParse("document has no root element".into()))
}

fn start_to_node(start: &BytesStart<'_>, line: u64) -> Result<XmlNode, SerialError> {
    let name = String::from_utf8(start.name().as_ref().to_vec())
        .map_err(|e| SerialError::TextParse(format!("bad element name: {e}")))?;
    let mut node = XmlNode::new(&name);
    node.line = line;
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SerialError::TextParse(format!("bad attribute: {e}")))?;
        let key = String::from_utf8(attr.key.as_ref().to_vec())
            .map_err(|e| SerialError::TextParse(format!("bad attribute name: {e}")))?;
        let value = attr
            .unescape_value()
            .map_err(|e| SerialError::TextParse(format!("bad attribute value: {e}")))?;
        node.attrs.push((key, value.into_owned()));
    }
    Ok(node)
}

fn attach(
    stack: &mut Vec<XmlNode>,
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), SerialError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(SerialError::TextParse("multiple root elements".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_compact() {
        let mut root = XmlNode::new("data");
        let mut x = XmlNode::new("x");
        x.text = "1".into();
        root.children.push(x);

        let flags = PrintFlags {
            no_header: true,
            indent: false,
        };
        assert_eq!(render(&root, flags).unwrap(), "<data><x>1</x></data>");
    }

    #[test]
    fn test_render_empty_node_self_closes() {
        let mut root = XmlNode::new("data");
        root.set_attr("class", "test.Res");

        let flags = PrintFlags {
            no_header: true,
            indent: false,
        };
        assert_eq!(render(&root, flags).unwrap(), "<data class=\"test.Res\"/>");
    }

    #[test]
    fn test_header_flag() {
        let root = XmlNode::new("data");
        let rendered = render(&root, PrintFlags::default()).unwrap();
        assert!(rendered.starts_with("<?xml"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let parsed = parse("<data a=\"1\"><x>7</x><y/></data>").unwrap();
        assert_eq!(parsed.name, "data");
        assert_eq!(parsed.attr("a"), Some("1"));
        assert_eq!(parsed.children.len(), 2);
        assert_eq!(parsed.children[0].text, "7");
        assert_eq!(parsed.children[1].name, "y");
    }

    #[test]
    fn test_parse_is_whitespace_liberal() {
        let parsed = parse("  <data>\n   <x>\n  42  \n</x>\n</data>  ").unwrap();
        assert_eq!(parsed.children[0].text, "42");
    }

    #[test]
    fn test_parse_escapes() {
        let parsed = parse("<data>a &lt;&amp;&gt; b</data>").unwrap();
        assert_eq!(parsed.text, "a <&> b");

        let mut node = XmlNode::new("data");
        node.text = "a <&> b".into();
        let flags = PrintFlags {
            no_header: true,
            indent: false,
        };
        let rendered = render(&node, flags).unwrap();
        assert_eq!(parse(&rendered).unwrap().text, "a <&> b");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse("<data><x></data>").is_err());
        assert!(parse("").is_err());
    }
}
