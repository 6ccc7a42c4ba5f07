use serde::{Deserialize, Serialize};

use crate::constraints::{Constraint, StringAttribute};
use crate::errors::EngineError;
use crate::value::{AnyValue, ValueKind};

/// Marker prefix on `Both`-category attribute values that switches the value
/// from a literal to a workspace variable name.
pub const INDIRECTION_MARKER: char = '@';

/// Attribute name every instruction and variable understands.
pub const NAME_ATTRIBUTE: &str = "name";

/// How an attribute string is to be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeCategory {
    /// The string parses to a value of the declared kind.
    Literal,
    /// The string holds a workspace variable name, possibly with a field path.
    VariableName,
    /// Literal by default; an `@` prefix switches to variable indirection.
    Both,
}

/// Declared shape of one attribute: expected kind, mandatory flag, category.
#[derive(Clone, Debug)]
pub struct AttributeDefinition {
    name: String,
    kind: ValueKind,
    mandatory: bool,
    category: AttributeCategory,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        AttributeDefinition {
            name: name.into(),
            kind,
            mandatory: false,
            category: AttributeCategory::Literal,
        }
    }

    pub fn set_mandatory(&mut self) -> &mut Self {
        self.mandatory = true;
        self
    }

    pub fn set_category(&mut self, category: AttributeCategory) -> &mut Self {
        self.category = category;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn category(&self) -> AttributeCategory {
        self.category
    }
}

/// Interpretation of one attribute's raw string: either a workspace variable
/// name (with optional field path) or a literal to parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeValueInfo {
    pub is_varname: bool,
    pub value: String,
}

/// Holds an instruction's or variable's attribute definitions, raw string
/// attributes and constraints, and validates their consistency.
#[derive(Debug, Default)]
pub struct AttributeHandler {
    definitions: Vec<AttributeDefinition>,
    constraints: Vec<Constraint>,
    attributes: Vec<StringAttribute>,
    failed_constraints: Vec<String>,
}

impl AttributeHandler {
    pub fn new() -> Self {
        let mut handler = AttributeHandler::default();
        // Every instruction and variable may carry a display name.
        handler.add_definition(NAME_ATTRIBUTE, ValueKind::String);
        handler
    }

    pub fn add_definition(
        &mut self,
        name: impl Into<String>,
        kind: ValueKind,
    ) -> &mut AttributeDefinition {
        self.definitions.push(AttributeDefinition::new(name, kind));
        self.definitions.last_mut().unwrap()
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn definitions(&self) -> &[AttributeDefinition] {
        &self.definitions
    }

    pub fn definition(&self, name: &str) -> Option<&AttributeDefinition> {
        self.definitions.iter().find(|d| d.name() == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|(n, _)| n == name)
    }

    /// Add a raw string attribute; returns false when the name is taken.
    pub fn add_string_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if self.has_attribute(&name) {
            return false;
        }
        self.attributes.push((name, value.into()));
        true
    }

    pub fn set_string_attribute(&mut self, name: &str, value: impl Into<String>) {
        match self.attributes.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.into(),
            None => self.attributes.push((name.to_string(), value.into())),
        }
    }

    pub fn string_attributes(&self) -> &[StringAttribute] {
        &self.attributes
    }

    pub fn attribute_string(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Validate mandatory attributes, literal parseability and all registered
    /// constraints. Failures are recorded and retrievable afterwards.
    pub fn validate(&mut self) -> bool {
        self.failed_constraints.clear();
        for definition in &self.definitions {
            let present = self.attributes.iter().any(|(n, _)| n == definition.name());
            if definition.is_mandatory() && !present {
                self.failed_constraints
                    .push(format!("Exists({})", definition.name()));
                continue;
            }
            if !present || definition.kind() == ValueKind::Any {
                continue;
            }
            if let Some((_, raw)) = self
                .attributes
                .iter()
                .find(|(n, _)| n == definition.name())
            {
                let literal = match definition.category() {
                    AttributeCategory::Literal => Some(raw.as_str()),
                    AttributeCategory::Both if !raw.starts_with(INDIRECTION_MARKER) => {
                        Some(raw.as_str())
                    }
                    _ => None,
                };
                if let Some(repr) = literal {
                    if definition.kind().parse_literal(repr).is_err() {
                        self.failed_constraints.push(format!(
                            "Type of ({}) must be ({:?})",
                            definition.name(),
                            definition.kind()
                        ));
                    }
                }
            }
        }
        // Attributes read at runtime must have a matching definition.
        for (name, _) in &self.attributes {
            if self.definitions.iter().all(|d| d.name() != name) {
                self.failed_constraints
                    .push(format!("No definition for attribute ({name})"));
            }
        }
        for constraint in &self.constraints {
            if !constraint.validate(&self.attributes) {
                self.failed_constraints.push(constraint.representation());
            }
        }
        self.failed_constraints.is_empty()
    }

    pub fn failed_constraints(&self) -> &[String] {
        &self.failed_constraints
    }

    pub fn clear_failed_constraints(&mut self) {
        self.failed_constraints.clear();
    }

    /// Interpret the raw string of `name` according to its definition's
    /// category. `None` when the attribute is absent or undeclared.
    pub fn value_info(&self, name: &str) -> Option<AttributeValueInfo> {
        let definition = self.definition(name)?;
        let raw = self.attribute_string(name)?;
        let info = match definition.category() {
            AttributeCategory::VariableName => AttributeValueInfo {
                is_varname: true,
                value: raw.to_string(),
            },
            AttributeCategory::Both if raw.starts_with(INDIRECTION_MARKER) => AttributeValueInfo {
                is_varname: true,
                value: raw[INDIRECTION_MARKER.len_utf8()..].to_string(),
            },
            _ => AttributeValueInfo {
                is_varname: false,
                value: raw.to_string(),
            },
        };
        Some(info)
    }

    /// Parse the literal value of `name` against its declared kind. Fails for
    /// variable-name attributes and absent attributes.
    pub fn literal_value(&self, name: &str) -> Result<AnyValue, EngineError> {
        let definition = self
            .definition(name)
            .ok_or_else(|| EngineError::InvalidOperation(format!("no definition for attribute '{name}'")))?;
        let info = self.value_info(name).ok_or_else(|| {
            EngineError::InvalidOperation(format!("attribute '{name}' is not present"))
        })?;
        if info.is_varname {
            return Err(EngineError::InvalidOperation(format!(
                "attribute '{name}' refers to a variable and has no literal value"
            )));
        }
        definition.kind().parse_literal(&info.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mandatory_attributes_are_enforced() {
        let mut handler = AttributeHandler::new();
        handler
            .add_definition("inputVar", ValueKind::String)
            .set_category(AttributeCategory::VariableName)
            .set_mandatory();
        assert!(!handler.validate());
        assert_eq!(handler.failed_constraints(), ["Exists(inputVar)"]);

        handler.add_string_attribute("inputVar", "x");
        assert!(handler.validate());
    }

    #[test]
    fn literal_kinds_are_checked_during_validation() {
        let mut handler = AttributeHandler::new();
        handler.add_definition("timeout", ValueKind::Float);
        handler.add_string_attribute("timeout", "not a number");
        assert!(!handler.validate());

        handler.set_string_attribute("timeout", "2.5");
        assert!(handler.validate());
        assert_eq!(handler.literal_value("timeout").unwrap(), json!(2.5));
    }

    #[test]
    fn undeclared_attributes_fail_validation() {
        let mut handler = AttributeHandler::new();
        handler.add_string_attribute("mystery", "1");
        assert!(!handler.validate());
    }

    #[test]
    fn both_category_switches_on_marker() {
        let mut handler = AttributeHandler::new();
        handler
            .add_definition("timeout", ValueKind::Float)
            .set_category(AttributeCategory::Both);
        handler.add_string_attribute("timeout", "@delays.short");
        let info = handler.value_info("timeout").unwrap();
        assert!(info.is_varname);
        assert_eq!(info.value, "delays.short");
        assert!(handler.validate());

        handler.set_string_attribute("timeout", "1.5");
        let info = handler.value_info("timeout").unwrap();
        assert!(!info.is_varname);
    }

    #[test]
    fn duplicate_attribute_names_are_rejected() {
        let mut handler = AttributeHandler::new();
        assert!(handler.add_string_attribute("name", "first"));
        assert!(!handler.add_string_attribute("name", "second"));
        assert_eq!(handler.attribute_string("name"), Some("first"));
    }
}
