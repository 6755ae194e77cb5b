//! Event and key definitions.
//!
//! Defines `Event` for invalidation triggers and `PipelineKey` for cached
//! pipeline results. The registry itself only needs the `RegistryItem` bounds,
//! so any comparable, serializable type can stand in for either side.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Bounds shared by everything the registry indexes.
///
/// Blanket-implemented; there is nothing to implement by hand.
pub trait RegistryItem:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> RegistryItem for T where
    T: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Identifies a class of invalidation trigger.
///
/// Events carry no cache content; two events are the same trigger exactly when
/// they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A named trigger, e.g. `catalog-reloaded`.
    Named { name: String },
    /// A name/value pair changed, e.g. `table=products`.
    NameValue { name: String, value: String },
}

impl Event {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named { name: name.into() }
    }

    pub fn name_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::NameValue {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Named { name } | Self::NameValue { name, .. } => name,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { name } => f.write_str(name),
            Self::NameValue { name, value } => write!(f, "{name}={value}"),
        }
    }
}

/// Kind of sitemap component contributing to a pipeline key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Generator,
    Transformer,
    Serializer,
    Reader,
}

impl ComponentKind {
    fn code(self) -> char {
        match self {
            Self::Generator => 'G',
            Self::Transformer => 'T',
            Self::Serializer => 'S',
            Self::Reader => 'R',
        }
    }
}

/// Cache key contributed by a single pipeline component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentKey {
    pub kind: ComponentKind,
    pub role: String,
    pub key: String,
}

/// Identifies a cached pipeline result.
///
/// The registry never looks inside; only the cache builds and displays these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineKey {
    components: Vec<ComponentKey>,
}

impl PipelineKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component key, builder style.
    pub fn with(
        mut self,
        kind: ComponentKind,
        role: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.components.push(ComponentKey {
            kind,
            role: role.into(),
            key: key.into(),
        });
        self
    }

    pub fn components(&self) -> &[ComponentKey] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, component) in self.components.iter().enumerate() {
            if idx > 0 {
                f.write_str(";")?;
            }
            write!(
                f,
                "{}-{}-{}",
                component.kind.code(),
                component.role,
                component.key
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    use super::*;

    fn hash_value<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn event_equality_is_structural() {
        assert_eq!(Event::named("reload"), Event::named("reload"));
        assert_eq!(
            Event::name_value("table", "products"),
            Event::name_value("table", "products")
        );
        assert_ne!(
            Event::name_value("table", "products"),
            Event::name_value("table", "orders")
        );
        assert_ne!(Event::named("table"), Event::name_value("table", ""));
    }

    #[test]
    fn equal_events_hash_equal() {
        let left = Event::name_value("table", "products");
        let right = Event::name_value("table".to_string(), "products".to_string());
        assert_eq!(hash_value(&left), hash_value(&right));
    }

    #[test]
    fn event_display() {
        assert_eq!(Event::named("reload").to_string(), "reload");
        assert_eq!(Event::name_value("table", "x").to_string(), "table=x");
        assert_eq!(Event::name_value("table", "x").name(), "table");
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Event::name_value("a", "b")).expect("serialize");
        assert_eq!(json, r#"{"kind":"name_value","name":"a","value":"b"}"#);
    }

    #[test]
    fn pipeline_key_display_lists_components_in_order() {
        let key = PipelineKey::new()
            .with(ComponentKind::Generator, "file", "docs/index.xml")
            .with(ComponentKind::Transformer, "xslt", "page.xsl")
            .with(ComponentKind::Serializer, "html", "");

        assert_eq!(
            key.to_string(),
            "G-file-docs/index.xml;T-xslt-page.xsl;S-html-"
        );
        assert_eq!(key.components().len(), 3);
    }

    #[test]
    fn component_order_matters_for_equality() {
        let a = PipelineKey::new()
            .with(ComponentKind::Generator, "file", "a")
            .with(ComponentKind::Transformer, "xslt", "b");
        let b = PipelineKey::new()
            .with(ComponentKind::Transformer, "xslt", "b")
            .with(ComponentKind::Generator, "file", "a");
        assert_ne!(a, b);
    }
}
