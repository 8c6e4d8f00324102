//! Strict boundary schema of a bundled animation module.
//!
//! Every struct rejects unknown fields: a bundle that declares anything this crate does not
//! understand is refused instead of being partially trusted.

use std::collections::BTreeMap;

use crate::foundation::core::FrameSize;

/// Top-level export of a bundled animation module.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AnimationModuleDef {
    pub name: String,
    pub frame_count: u64,
    pub frame_size: FrameSize,
    /// Frames per second of the composed video.
    pub frame_rate: u32,
    /// Encoder constant-rate-factor (0 = lossless, 51 = worst).
    pub quality_factor: u8,
    /// Named expressions, visible to every other expression in the module.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: BTreeMap<String, String>,
    /// Template of the frame description produced for every frame index.
    pub frame: ElementDef,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ElementDef {
    pub element: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDef>,
    /// Boolean expression; the element (and its subtree) is omitted from frames where it is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_when: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum NodeDef {
    Element(ElementDef),
    Text(TextDef),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextDef {
    pub text: AttributeDef,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum AttributeDef {
    Number(f64),
    Text(String),
    Expression(ExpressionDef),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpressionDef {
    pub expression: String,
}

/// A definitions library pulled in through `imports` by the bundler.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryDef {
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub definitions: BTreeMap<String, String>,
}
