//! Concrete frame descriptions and their static SVG markup.

use std::fmt::Write as _;

use crate::foundation::core::FrameSize;

const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// Declarative description of one frame, produced by
/// [`AnimationModule::render_frame`](crate::AnimationModule::render_frame).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FrameDescription {
    pub root: Element,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Element {
    pub name: String,
    /// Attributes in name order.
    pub attributes: Vec<(String, AttributeValue)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl AttributeValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Bool(_) | Self::Text(_) => None,
        }
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Self::Number(v) => out.push_str(&format_number(*v)),
            Self::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
            Self::Text(s) => escape_into(out, s),
        }
    }
}

impl Element {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Depth-first search for the first element named `name`, including `self`.
    pub fn find_first(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| match child {
            Node::Element(el) => el.find_first(name),
            Node::Text(_) => None,
        })
    }

    fn write_markup(&self, out: &mut String, extra_attrs: &[(&str, String)]) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in extra_attrs {
            let _ = write!(out, " {name}=\"");
            escape_into(out, value);
            out.push('"');
        }
        for (name, value) in &self.attributes {
            let _ = write!(out, " {name}=\"");
            value.write_to(out);
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(el) => el.write_markup(out, &[]),
                Node::Text(text) => escape_into(out, text),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

impl FrameDescription {
    /// Render the description to a standalone SVG document sized to `size`.
    ///
    /// A root `<svg>` element is completed with the namespace and any missing `width`,
    /// `height` and `viewBox`; any other root is wrapped in an `<svg>` of the frame size.
    pub fn to_svg_markup(&self, size: FrameSize) -> String {
        let mut out = String::with_capacity(256);
        let width = size.width.to_string();
        let height = size.height.to_string();
        let view_box = format!("0 0 {} {}", size.width, size.height);

        if self.root.name == "svg" {
            let mut extra = Vec::new();
            for (name, value) in [
                ("xmlns", SVG_NS.to_owned()),
                ("width", width),
                ("height", height),
                ("viewBox", view_box),
            ] {
                if self.root.attribute(name).is_none() {
                    extra.push((name, value));
                }
            }
            self.root.write_markup(&mut out, &extra);
        } else {
            let _ = write!(
                out,
                "<svg xmlns=\"{SVG_NS}\" width=\"{width}\" height=\"{height}\" viewBox=\"{view_box}\">"
            );
            self.root.write_markup(&mut out, &[]);
            out.push_str("</svg>");
        }
        out
    }
}

/// Shortest round-trip decimal form; negative zero prints as `0`.
pub(crate) fn format_number(v: f64) -> String {
    if v == 0.0 {
        return "0".to_owned();
    }
    format!("{v}")
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle() -> Element {
        Element {
            name: "circle".to_owned(),
            attributes: vec![
                ("cx".to_owned(), AttributeValue::Number(65.0)),
                ("fill".to_owned(), AttributeValue::Text("a<b".to_owned())),
            ],
            children: vec![],
        }
    }

    #[test]
    fn non_svg_roots_are_wrapped() {
        let desc = FrameDescription { root: circle() };
        let markup = desc.to_svg_markup(FrameSize::new(100, 50).unwrap());
        assert_eq!(
            markup,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"100\" height=\"50\" \
             viewBox=\"0 0 100 50\"><circle cx=\"65\" fill=\"a&lt;b\"/></svg>"
        );
    }

    #[test]
    fn svg_roots_keep_their_own_viewbox() {
        let desc = FrameDescription {
            root: Element {
                name: "svg".to_owned(),
                attributes: vec![(
                    "viewBox".to_owned(),
                    AttributeValue::Text("0 0 10 10".to_owned()),
                )],
                children: vec![Node::Element(circle()), Node::Text("x & y".to_owned())],
            },
        };
        let markup = desc.to_svg_markup(FrameSize::new(100, 100).unwrap());
        assert!(markup.starts_with(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"100\" height=\"100\" viewBox=\"0 0 10 10\">"
        ));
        assert!(markup.ends_with("x &amp; y</svg>"));
        assert_eq!(markup.matches("viewBox").count(), 1);
    }

    #[test]
    fn numbers_use_shortest_form() {
        assert_eq!(format_number(65.0), "65");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.25), "0.25");
    }

    #[test]
    fn find_first_walks_depth_first() {
        let root = Element {
            name: "g".to_owned(),
            attributes: vec![],
            children: vec![Node::Text("t".to_owned()), Node::Element(circle())],
        };
        assert_eq!(root.find_first("circle").map(|c| c.name.as_str()), Some("circle"));
        assert!(root.find_first("rect").is_none());
    }
}
