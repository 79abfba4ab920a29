//! Renderer Contract (§4.G), grounded on `frontik/handler.py`'s `register_renderer` / `_render`
//! and the built-in `frontik.renderers.GenericRenderer` / `json_renderer`.
use std::fmt;

use serde_json::Value;

/// The handler-local facts a renderer's `can_apply`/`render` consult: whichever of a template
/// name, a JSON value, or a plain-text body the page method populated. A page sets at most one of
/// these in ordinary use; the registry's priority order is what makes the choice deterministic
/// when more than one happens to be set.
#[derive(Debug, Default, Clone)]
pub struct RenderData {
    pub template: Option<String>,
    pub json: Option<Value>,
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RenderedBody {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// §4.G: "Each renderer exposes `can_apply() -> bool` and `render() -> bytes`... A renderer that
/// cannot apply must be a pure check with no side effects." `can_apply` therefore takes `&self`
/// only (no interior mutability expected); `render` is responsible for setting `Content-Type`.
pub trait Renderer: fmt::Debug {
    fn can_apply(&self, data: &RenderData) -> bool;
    fn render(&self, data: &RenderData) -> RenderedBody;
}

/// Fixed partial order from §4.F: template renderers outrank the generic text renderer, which
/// outranks JSON/XML. Lower number wins. External template renderers (Jinja, XSLT — out of scope
/// here per §1) should register below this constant.
pub const TEMPLATE_RENDERER_PRIORITY: u32 = 0;
pub const GENERIC_RENDERER_PRIORITY: u32 = 10;
pub const JSON_RENDERER_PRIORITY: u32 = 20;

/// Ordered `(priority, renderer)` pairs, built by binary-search insertion rather than a priority
/// queue (§9 "Renderer priority set": iteration order must be deterministic, including stable
/// order among equal priorities, which a `BinaryHeap` cannot guarantee).
#[derive(Default)]
pub struct RendererRegistry {
    entries: Vec<(u32, Box<dyn Renderer>)>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a renderer. Stable at equal priority: a renderer registered later with the same
    /// priority as an existing one is tried after it.
    pub fn register(&mut self, priority: u32, renderer: Box<dyn Renderer>) {
        let index = self.entries.partition_point(|(p, _)| *p <= priority);
        self.entries.insert(index, (priority, renderer));
    }

    /// The first registered renderer, in priority order, whose `can_apply` returns true. `None`
    /// means the pipeline finishes with an empty body (§4.F).
    pub fn select(&self, data: &RenderData) -> Option<&dyn Renderer> {
        self.entries
            .iter()
            .find(|(_, r)| r.can_apply(data))
            .map(|(_, r)| r.as_ref())
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(GENERIC_RENDERER_PRIORITY, Box::new(GenericRenderer));
        registry.register(JSON_RENDERER_PRIORITY, Box::new(JsonRenderer));
        registry
    }
}

/// Plain-text/HTML fallback renderer, grounded on `frontik.renderers.GenericRenderer`: applies
/// whenever the page set a text body, emits it as `text/html` if no content type was already
/// chosen by the page (matching the original's default).
#[derive(Debug)]
pub struct GenericRenderer;

impl Renderer for GenericRenderer {
    fn can_apply(&self, data: &RenderData) -> bool {
        data.text.is_some()
    }

    fn render(&self, data: &RenderData) -> RenderedBody {
        RenderedBody {
            content_type: Some("text/html; charset=utf-8".to_owned()),
            body: data.text.clone().unwrap_or_default().into_bytes(),
        }
    }
}

/// Grounded on `frontik.renderers.json_renderer`: lowest priority, applies whenever the page
/// populated a JSON value (including `Value::Null`, distinct from "not set").
#[derive(Debug)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn can_apply(&self, data: &RenderData) -> bool {
        data.json.is_some()
    }

    fn render(&self, data: &RenderData) -> RenderedBody {
        let value = data.json.clone().unwrap_or(Value::Null);
        RenderedBody {
            content_type: Some("application/json".to_owned()),
            body: serde_json::to_vec(&value).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct FakeTemplateRenderer;

    impl Renderer for FakeTemplateRenderer {
        fn can_apply(&self, data: &RenderData) -> bool {
            data.template.is_some()
        }

        fn render(&self, _data: &RenderData) -> RenderedBody {
            RenderedBody {
                content_type: Some("text/html".to_owned()),
                body: b"<rendered>".to_vec(),
            }
        }
    }

    /// Seed test 6: template, JSON, and generic all registered; template set on the data wins.
    #[test]
    fn template_renderer_wins_over_json_and_generic_when_template_set() {
        let mut registry = RendererRegistry::with_defaults();
        registry.register(TEMPLATE_RENDERER_PRIORITY, Box::new(FakeTemplateRenderer));

        let data = RenderData {
            template: Some("widgets.html".to_owned()),
            json: Some(Value::from(1)),
            text: Some("ignored".to_owned()),
        };

        let rendered = registry.select(&data).unwrap().render(&data);
        assert_eq!(rendered.content_type.as_deref(), Some("text/html"));
        assert_eq!(rendered.body, b"<rendered>");
    }

    #[test]
    fn json_wins_when_only_json_and_generic_are_eligible() {
        let registry = RendererRegistry::with_defaults();
        let data = RenderData {
            template: None,
            json: Some(Value::from(42)),
            text: Some("also set".to_owned()),
        };
        let rendered = registry.select(&data).unwrap().render(&data);
        assert_eq!(rendered.content_type.as_deref(), Some("application/json"));
        assert_eq!(rendered.body, b"42");
    }

    #[test]
    fn no_applicable_renderer_yields_none() {
        let registry = RendererRegistry::with_defaults();
        let data = RenderData::default();
        assert!(registry.select(&data).is_none());
    }

    #[test]
    fn equal_priority_ties_break_by_registration_order() {
        #[derive(Debug)]
        struct AlwaysApplies(&'static str);
        impl Renderer for AlwaysApplies {
            fn can_apply(&self, _data: &RenderData) -> bool {
                true
            }
            fn render(&self, _data: &RenderData) -> RenderedBody {
                RenderedBody {
                    content_type: None,
                    body: self.0.as_bytes().to_vec(),
                }
            }
        }

        let mut registry = RendererRegistry::new();
        registry.register(5, Box::new(AlwaysApplies("first")));
        registry.register(5, Box::new(AlwaysApplies("second")));

        let rendered = registry.select(&RenderData::default()).unwrap().render(&RenderData::default());
        assert_eq!(rendered.body, b"first");
    }
}
