use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use sha2::{Digest, Sha256};

use crate::attributes::NAME_ATTRIBUTE;
use crate::errors::EngineError;
use crate::procedure::{
    Procedure, ProcedurePreamble, ProcedureTemplate, TypeRegistration, TypeRegistrationMode,
    VariableDescription,
};
use crate::tree::InstructionDescription;

const PROCEDURE_ELEMENT: &str = "Procedure";
const WORKSPACE_ELEMENT: &str = "Workspace";
const REGISTER_TYPE_ELEMENT: &str = "RegisterType";
const PLUGIN_ELEMENT: &str = "Plugin";
const JSON_TYPE_ATTRIBUTE: &str = "jsontype";
const JSON_FILE_ATTRIBUTE: &str = "jsonfile";

// ─── Generic element tree ─────────────────────────────────────

#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlElement>,
    text: String,
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, EngineError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute =
            attribute.map_err(|e| EngineError::Parse(format!("malformed attribute: {e}")))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| EngineError::Parse(format!("malformed attribute value: {e}")))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

/// Parse an XML document into a single-rooted element tree.
fn parse_document(xml: &str) -> Result<XmlElement, EngineError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    let mut attach = |element: XmlElement, stack: &mut Vec<XmlElement>| -> Result<(), EngineError> {
        match stack.last_mut() {
            Some(parent) => {
                parent.children.push(element);
                Ok(())
            }
            None if root.is_none() => {
                root = Some(element);
                Ok(())
            }
            None => Err(EngineError::Parse(
                "document has more than one root element".into(),
            )),
        }
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref start)) => stack.push(element_from(start)?),
            Ok(Event::Empty(ref start)) => attach(element_from(start)?, &mut stack)?,
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| EngineError::Parse("unbalanced closing tag".into()))?;
                attach(element, &mut stack)?;
            }
            Ok(Event::Text(ref text)) => {
                if let (Some(top), Ok(content)) = (stack.last_mut(), text.unescape()) {
                    let trimmed = content.trim();
                    if !trimmed.is_empty() {
                        top.text.push_str(trimmed);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(EngineError::Parse(format!("XML parse error: {e}"))),
        }
        buf.clear();
    }
    root.ok_or_else(|| EngineError::Parse("document has no root element".into()))
}

// ─── Template construction ────────────────────────────────────

fn instruction_from_element(element: &XmlElement) -> InstructionDescription {
    InstructionDescription {
        type_name: element.name.clone(),
        attributes: element.attributes.clone(),
        children: element.children.iter().map(instruction_from_element).collect(),
    }
}

fn variable_from_element(element: &XmlElement) -> Result<VariableDescription, EngineError> {
    let name = element
        .attributes
        .iter()
        .find(|(key, _)| key == NAME_ATTRIBUTE)
        .map(|(_, value)| value.clone())
        .ok_or_else(|| {
            EngineError::Parse(format!(
                "workspace variable of type '{}' is missing a name attribute",
                element.name
            ))
        })?;
    Ok(VariableDescription {
        type_name: element.name.clone(),
        name,
        attributes: element.attributes.clone(),
    })
}

fn preamble_entry(
    element: &XmlElement,
    preamble: &mut ProcedurePreamble,
) -> Result<(), EngineError> {
    match element.name.as_str() {
        REGISTER_TYPE_ELEMENT => {
            let registration = element
                .attributes
                .iter()
                .find_map(|(key, value)| match key.as_str() {
                    JSON_TYPE_ATTRIBUTE => Some(TypeRegistration {
                        mode: TypeRegistrationMode::JsonString,
                        payload: value.clone(),
                    }),
                    JSON_FILE_ATTRIBUTE => Some(TypeRegistration {
                        mode: TypeRegistrationMode::JsonFile,
                        payload: value.clone(),
                    }),
                    _ => None,
                })
                .ok_or_else(|| {
                    EngineError::Parse(
                        "RegisterType requires a 'jsontype' or 'jsonfile' attribute".into(),
                    )
                })?;
            preamble.type_registrations.push(registration);
        }
        PLUGIN_ELEMENT => {
            if element.text.is_empty() {
                return Err(EngineError::Parse("Plugin element has no content".into()));
            }
            preamble.plugin_paths.push(element.text.clone());
        }
        _ => unreachable!("caller dispatches on element name"),
    }
    Ok(())
}

/// Build a procedure template from XML text.
pub fn template_from_string(xml: &str) -> Result<ProcedureTemplate, EngineError> {
    let document = parse_document(xml)?;
    if document.name != PROCEDURE_ELEMENT {
        return Err(EngineError::Parse(format!(
            "expected root element '{PROCEDURE_ELEMENT}', found '{}'",
            document.name
        )));
    }
    let mut template = ProcedureTemplate::default();
    for child in &document.children {
        match child.name.as_str() {
            WORKSPACE_ELEMENT => {
                for variable in &child.children {
                    template.variables.push(variable_from_element(variable)?);
                }
            }
            REGISTER_TYPE_ELEMENT | PLUGIN_ELEMENT => {
                preamble_entry(child, &mut template.preamble)?;
            }
            _ => template.instructions.push(instruction_from_element(child)),
        }
    }
    Ok(template)
}

/// Parse a procedure file into a template.
pub fn template_from_file(path: &Path) -> Result<ProcedureTemplate, EngineError> {
    let xml = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(format!("could not read '{}': {e}", path.display()))
    })?;
    template_from_string(&xml)
}

/// Parse XML text into a ready-to-setup procedure.
pub fn procedure_from_string(xml: &str, filename: &str) -> Result<Procedure, EngineError> {
    let template = template_from_string(xml)?;
    let mut procedure = Procedure::from_template(template, filename)?;
    let mut hasher = Sha256::new();
    hasher.update(xml.as_bytes());
    procedure.set_source_hash(format!("{:x}", hasher.finalize()));
    Ok(procedure)
}

/// Load and parse a procedure file.
pub fn procedure_from_file(path: &Path) -> Result<Procedure, EngineError> {
    let xml = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Parse(format!("could not read '{}': {e}", path.display()))
    })?;
    procedure_from_string(&xml, &path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Procedure>
  <Plugin>liboac-tree-extras.so</Plugin>
  <RegisterType jsontype='{"type":"scan_config"}'/>
  <Workspace>
    <Local name="x" type="int32" value="7"/>
    <Local name="y" type="int32" value="0"/>
  </Workspace>
  <Sequence name="main">
    <Copy inputVar="x" outputVar="y"/>
    <Wait timeout="0.1"/>
  </Sequence>
</Procedure>"#;

    #[test]
    fn sample_parses_into_template() {
        let template = template_from_string(SAMPLE).unwrap();
        assert_eq!(template.variables.len(), 2);
        assert_eq!(template.variables[0].name, "x");
        assert_eq!(template.variables[0].type_name, "Local");
        assert_eq!(template.instructions.len(), 1);
        let main = &template.instructions[0];
        assert_eq!(main.type_name, "Sequence");
        assert_eq!(main.display_name(), "main");
        assert_eq!(main.children.len(), 2);
        assert_eq!(main.children[0].type_name, "Copy");
        assert_eq!(template.preamble.plugin_paths, ["liboac-tree-extras.so"]);
        assert_eq!(template.preamble.type_registrations.len(), 1);
        assert_eq!(
            template.preamble.type_registrations[0].mode,
            TypeRegistrationMode::JsonString
        );
    }

    #[test]
    fn procedure_from_string_records_source_hash() {
        let procedure = procedure_from_string(SAMPLE, "sample.xml").unwrap();
        assert_eq!(procedure.filename(), "sample.xml");
        let hash = procedure.source_hash().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn root_element_must_be_procedure() {
        let err = template_from_string("<Workflow/>").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(template_from_string("<Procedure><Sequence></Procedure>").is_err());
        assert!(template_from_string("").is_err());
    }

    #[test]
    fn workspace_variables_require_names() {
        let xml = r#"<Procedure><Workspace><Local type="int32"/></Workspace></Procedure>"#;
        assert!(template_from_string(xml).is_err());
    }

    #[test]
    fn unknown_instruction_types_fail_at_instantiation() {
        let xml = "<Procedure><Teleport/></Procedure>";
        let template = template_from_string(xml).unwrap();
        assert!(Procedure::from_template(template, "bad.xml").is_err());
    }
}
