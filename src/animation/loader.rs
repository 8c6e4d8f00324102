//! Loads a bundled animation module into a validated, executable [`AnimationModule`].
//!
//! Loading never runs anything the module declares outside the expression VM: the document is
//! checked against the strict schema in [`schema`](super::schema), names are validated, and
//! every expression is compiled to bytecode up front. Any mismatch is reported as an error.

use std::path::Path;

use anyhow::Context as _;

use crate::{
    animation::{
        frame::{AttributeValue, Element, FrameDescription, Node},
        schema::{AnimationModuleDef, AttributeDef, ElementDef, NodeDef},
    },
    expression::{
        bytecode::{BytecodeProgram, InputField},
        compile::{DefinitionTable, Scope, compile_definitions, compile_expression},
        vm::{ValueSlot, VmError, eval_program},
    },
    foundation::{
        core::{FrameIndex, FrameSize},
        error::{FramesmithError, FramesmithResult},
    },
};

/// Upper bound on template elements per module.
pub const MAX_TEMPLATE_NODES: usize = 10_000;
/// Highest constant-rate-factor accepted by the encoder.
pub const MAX_QUALITY_FACTOR: u8 = 51;

/// A validated animation module: metadata plus a pure `render_frame` function.
#[derive(Debug, Clone)]
pub struct AnimationModule {
    pub name: String,
    pub frame_count: u64,
    pub frame_size: FrameSize,
    pub frame_rate: u32,
    pub quality_factor: u8,
    definitions: DefinitionTable,
    frame: CompiledElement,
}

#[derive(Debug, Clone)]
struct CompiledElement {
    name: String,
    attributes: Vec<(String, CompiledValue)>,
    children: Vec<CompiledNode>,
    visible_when: Option<BytecodeProgram>,
}

#[derive(Debug, Clone)]
enum CompiledNode {
    Element(CompiledElement),
    Text(CompiledValue),
}

#[derive(Debug, Clone)]
enum CompiledValue {
    Number(f64),
    Text(String),
    Expression(BytecodeProgram),
}

/// Parse, validate and compile a module from a bundle document.
pub fn load_module_value(value: serde_json::Value) -> FramesmithResult<AnimationModule> {
    let def: AnimationModuleDef = serde_json::from_value(value).map_err(|e| {
        FramesmithError::validation(format!(
            "module export does not match the animation module schema: {e}"
        ))
    })?;
    load_module_def(def)
}

/// Read and load a bundle file written by the bundler.
pub fn load_module_file(path: &Path) -> FramesmithResult<AnimationModule> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read bundle '{}'", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
        FramesmithError::build(format!("bundle '{}' is not valid JSON: {e}", path.display()))
    })?;
    load_module_value(value)
}

#[tracing::instrument(skip(def), fields(name = %def.name))]
pub fn load_module_def(def: AnimationModuleDef) -> FramesmithResult<AnimationModule> {
    if def.name.trim().is_empty() {
        return Err(FramesmithError::validation("module name must be non-empty"));
    }
    def.frame_size.validate()?;
    if def.frame_rate == 0 {
        return Err(FramesmithError::validation("frameRate must be > 0"));
    }
    if def.quality_factor > MAX_QUALITY_FACTOR {
        return Err(FramesmithError::validation(format!(
            "qualityFactor must be within 0..={MAX_QUALITY_FACTOR}, got {}",
            def.quality_factor
        )));
    }

    let base = Scope::with_frame_size(def.frame_size.width, def.frame_size.height);
    let (definitions, scope) = compile_definitions(&def.definitions, &base)
        .map_err(|e| FramesmithError::build(e.to_string()))?;

    let mut budget = MAX_TEMPLATE_NODES;
    let frame = compile_element(&def.frame, &scope, &mut budget)?;

    Ok(AnimationModule {
        name: def.name,
        frame_count: def.frame_count,
        frame_size: def.frame_size,
        frame_rate: def.frame_rate,
        quality_factor: def.quality_factor,
        definitions,
        frame,
    })
}

fn compile_element(
    def: &ElementDef,
    scope: &Scope,
    budget: &mut usize,
) -> FramesmithResult<CompiledElement> {
    if *budget == 0 {
        return Err(FramesmithError::validation(format!(
            "frame template exceeds {MAX_TEMPLATE_NODES} nodes"
        )));
    }
    *budget -= 1;

    if !is_markup_name(&def.element) {
        return Err(FramesmithError::validation(format!(
            "invalid element name '{}'",
            def.element
        )));
    }

    let mut attributes = Vec::with_capacity(def.attributes.len());
    for (name, value) in &def.attributes {
        if !is_markup_name(name) {
            return Err(FramesmithError::validation(format!(
                "invalid attribute name '{name}' on <{}>",
                def.element
            )));
        }
        let compiled = compile_value(value, scope).map_err(|e| {
            FramesmithError::build(format!("<{}> attribute '{name}': {e}", def.element))
        })?;
        attributes.push((name.clone(), compiled));
    }

    let visible_when = def
        .visible_when
        .as_deref()
        .map(|src| compile_expression(src, scope))
        .transpose()
        .map_err(|e| FramesmithError::build(format!("<{}> visibleWhen: {e}", def.element)))?;

    let mut children = Vec::with_capacity(def.children.len());
    for child in &def.children {
        children.push(match child {
            NodeDef::Element(el) => CompiledNode::Element(compile_element(el, scope, budget)?),
            NodeDef::Text(text) => {
                let value = compile_value(&text.text, scope).map_err(|e| {
                    FramesmithError::build(format!("<{}> text node: {e}", def.element))
                })?;
                CompiledNode::Text(value)
            }
        });
    }

    Ok(CompiledElement {
        name: def.element.clone(),
        attributes,
        children,
        visible_when,
    })
}

fn compile_value(
    def: &AttributeDef,
    scope: &Scope,
) -> Result<CompiledValue, crate::expression::ExprCompileError> {
    Ok(match def {
        AttributeDef::Number(v) => CompiledValue::Number(*v),
        AttributeDef::Text(s) => CompiledValue::Text(s.clone()),
        AttributeDef::Expression(e) => CompiledValue::Expression(compile_expression(&e.expression, scope)?),
    })
}

/// XML-style names: a letter or `_` followed by letters, digits, `_`, `-`, `.` or `:`.
fn is_markup_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

impl AnimationModule {
    /// Evaluate the module for one frame.
    ///
    /// Pure and deterministic: the same arguments always produce the same description.
    pub fn render_frame(
        &self,
        frame_index: FrameIndex,
        frame_count: u64,
    ) -> FramesmithResult<FrameDescription> {
        let mut ctx = EvalContext {
            frame_index: frame_index.0 as f64,
            frame_count: frame_count as f64,
            definitions: vec![None; self.definitions.len()],
            stack: Vec::with_capacity(16),
        };

        for &id in &self.definitions.eval_order {
            let program = &self.definitions.programs[id.0 as usize];
            let value = ctx.eval(program).map_err(|e| {
                FramesmithError::render(format!(
                    "frame {frame_index}: definition '{}': {e}",
                    self.definitions.names[id.0 as usize]
                ))
            })?;
            ctx.definitions[id.0 as usize] = Some(value);
        }

        let root = render_element(&self.frame, &mut ctx)
            .map_err(|e| FramesmithError::render(format!("frame {frame_index}: {e}")))?
            .ok_or_else(|| {
                FramesmithError::render(format!(
                    "frame {frame_index}: root element is hidden by visibleWhen"
                ))
            })?;
        Ok(FrameDescription { root })
    }
}

struct EvalContext {
    frame_index: f64,
    frame_count: f64,
    definitions: Vec<Option<ValueSlot>>,
    stack: Vec<ValueSlot>,
}

impl EvalContext {
    fn eval(&mut self, program: &BytecodeProgram) -> Result<ValueSlot, VmError> {
        let (frame_index, frame_count) = (self.frame_index, self.frame_count);
        let definitions = &self.definitions;
        eval_program(
            program,
            &mut self.stack,
            |field| match field {
                InputField::FrameIndex => ValueSlot::F64(frame_index),
                InputField::FrameCount => ValueSlot::F64(frame_count),
            },
            |id| {
                definitions
                    .get(id.0 as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| VmError::new("definition read before evaluation"))
            },
        )
    }

    fn eval_value(&mut self, value: &CompiledValue) -> Result<AttributeValue, String> {
        match value {
            CompiledValue::Number(v) => Ok(AttributeValue::Number(*v)),
            CompiledValue::Text(s) => Ok(AttributeValue::Text(s.clone())),
            CompiledValue::Expression(program) => match self.eval(program) {
                Ok(ValueSlot::F64(v)) if v.is_finite() => Ok(AttributeValue::Number(v)),
                Ok(ValueSlot::F64(v)) => Err(format!("expression produced non-finite value {v}")),
                Ok(ValueSlot::Bool(b)) => Ok(AttributeValue::Bool(b)),
                Err(e) => Err(e.to_string()),
            },
        }
    }
}

fn render_element(
    el: &CompiledElement,
    ctx: &mut EvalContext,
) -> Result<Option<Element>, String> {
    if let Some(program) = &el.visible_when {
        let visible = ctx
            .eval(program)
            .and_then(ValueSlot::as_bool)
            .map_err(|e| format!("<{}> visibleWhen: {e}", el.name))?;
        if !visible {
            return Ok(None);
        }
    }

    let mut attributes = Vec::with_capacity(el.attributes.len());
    for (name, value) in &el.attributes {
        let v = ctx
            .eval_value(value)
            .map_err(|e| format!("<{}> attribute '{name}': {e}", el.name))?;
        attributes.push((name.clone(), v));
    }

    let mut children = Vec::with_capacity(el.children.len());
    for child in &el.children {
        match child {
            CompiledNode::Element(child_el) => {
                if let Some(rendered) = render_element(child_el, ctx)? {
                    children.push(Node::Element(rendered));
                }
            }
            CompiledNode::Text(value) => {
                let text = match ctx
                    .eval_value(value)
                    .map_err(|e| format!("<{}> text node: {e}", el.name))?
                {
                    AttributeValue::Number(v) => crate::animation::frame::format_number(v),
                    AttributeValue::Bool(b) => b.to_string(),
                    AttributeValue::Text(s) => s,
                };
                children.push(Node::Text(text));
            }
        }
    }

    Ok(Some(Element {
        name: el.name.clone(),
        attributes,
        children,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orbit_module_json(frame_count: u64) -> serde_json::Value {
        json!({
            "name": "orbit",
            "frameCount": frame_count,
            "frameSize": {"width": 100, "height": 100},
            "frameRate": 10,
            "qualityFactor": 18,
            "definitions": {
                "angle": "2 * PI * frameIndex / frameCount",
                "radius": "15"
            },
            "frame": {
                "element": "svg",
                "attributes": {"viewBox": "0 0 100 100"},
                "children": [
                    {"element": "rect", "attributes": {"width": 100, "height": 100, "fill": "white"}},
                    {
                        "element": "circle",
                        "attributes": {
                            "cx": {"expression": "radius * cos(angle) + 50"},
                            "cy": {"expression": "radius * sin(angle) + 50"},
                            "r": 5,
                            "fill": "black"
                        }
                    },
                    {
                        "element": "text",
                        "visibleWhen": "frameIndex == 0",
                        "children": [{"text": {"expression": "frameIndex + 1"}}]
                    }
                ]
            }
        })
    }

    fn circle_center(desc: &FrameDescription) -> (f64, f64) {
        let circle = desc.root.find_first("circle").unwrap();
        (
            circle.attribute("cx").and_then(AttributeValue::as_f64).unwrap(),
            circle.attribute("cy").and_then(AttributeValue::as_f64).unwrap(),
        )
    }

    #[test]
    fn first_frame_places_the_circle_on_the_orbit_start() {
        let module = load_module_value(orbit_module_json(10)).unwrap();
        let desc = module.render_frame(FrameIndex(0), 10).unwrap();
        assert_eq!(circle_center(&desc), (65.0, 50.0));
    }

    #[test]
    fn render_frame_is_deterministic() {
        let module = load_module_value(orbit_module_json(10)).unwrap();
        for i in (0..module.frame_count).map(FrameIndex) {
            let a = module.render_frame(i, 10).unwrap();
            let b = module.render_frame(i, 10).unwrap();
            assert_eq!(a, b);
            let size = module.frame_size;
            assert_eq!(a.to_svg_markup(size), b.to_svg_markup(size));
        }
    }

    #[test]
    fn visible_when_prunes_subtrees() {
        let module = load_module_value(orbit_module_json(10)).unwrap();
        let first = module.render_frame(FrameIndex(0), 10).unwrap();
        let later = module.render_frame(FrameIndex(3), 10).unwrap();
        assert!(first.root.find_first("text").is_some());
        assert!(later.root.find_first("text").is_none());
    }

    #[test]
    fn unknown_top_level_fields_are_rejected() {
        let mut value = orbit_module_json(10);
        value["imports"] = json!(["./lib.json"]);
        let err = load_module_value(value).unwrap_err();
        assert!(err.is_validation(), "{err}");
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut value = orbit_module_json(10);
        value.as_object_mut().unwrap().remove("frameRate");
        assert!(load_module_value(value).unwrap_err().is_validation());
    }

    #[test]
    fn metadata_is_validated() {
        let mut value = orbit_module_json(10);
        value["qualityFactor"] = json!(60);
        assert!(load_module_value(value).is_err());

        let mut value = orbit_module_json(10);
        value["frameRate"] = json!(0);
        assert!(load_module_value(value).is_err());

        let mut value = orbit_module_json(10);
        value["frame"]["element"] = json!("bad name");
        assert!(load_module_value(value).is_err());
    }

    #[test]
    fn expression_errors_are_build_errors() {
        let mut value = orbit_module_json(10);
        value["frame"]["children"][1]["attributes"]["cx"] = json!({"expression": "nope + 1"});
        let err = load_module_value(value).unwrap_err();
        assert!(matches!(err, FramesmithError::Build(_)), "{err}");
        assert!(err.to_string().contains("attribute 'cx'"));
    }

    #[test]
    fn non_finite_values_fail_the_frame() {
        let mut value = orbit_module_json(10);
        value["frame"]["children"][1]["attributes"]["r"] = json!({"expression": "1 / frameIndex"});
        let module = load_module_value(value).unwrap();
        let err = module.render_frame(FrameIndex(0), 10).unwrap_err();
        assert!(matches!(err, FramesmithError::Render(_)));
        assert!(module.render_frame(FrameIndex(1), 10).is_ok());
    }

    #[test]
    fn zero_frame_modules_load() {
        let module = load_module_value(orbit_module_json(0)).unwrap();
        assert_eq!(module.frame_count, 0);
    }
}
