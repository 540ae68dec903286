use crate::model::{is_skipped_name, Node, PropertyAttributes, Value};

/// One property of a node as the serializer sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct GatheredProperty {
    /// Key the property is written under.
    pub name: String,
    /// Current value.
    pub value: Value,
    /// How the property is written.
    pub attributes: PropertyAttributes,
}

/// Lists the serializable properties of `node`.
///
/// Typed fields come first in declaration order, followed by the dynamic
/// properties in insertion order. Reserved `__` names and the identity
/// fields are left out.
pub fn gather(node: &dyn Node) -> Vec<GatheredProperty> {
    let fields = node.fields();
    let dynamic = node.core().dynamic();
    let mut gathered = Vec::with_capacity(fields.len() + dynamic.len());

    for field in fields {
        if is_skipped_name(field.name) {
            continue;
        }
        if let Some(value) = node.get_field(field.name) {
            gathered.push(GatheredProperty {
                name: field.name.to_string(),
                value,
                attributes: field.attributes,
            });
        }
    }

    for (name, value) in dynamic {
        if is_skipped_name(name) || fields.iter().any(|f| f.name == name.as_str()) {
            continue;
        }
        gathered.push(GatheredProperty {
            name: name.clone(),
            value: value.clone(),
            attributes: PropertyAttributes::from_dynamic_name(name),
        });
    }

    gathered
}
