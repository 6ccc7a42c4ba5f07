use crate::value::ValueKind;

/// A raw string attribute as stored on an instruction or variable.
pub type StringAttribute = (String, String);

/// Composable validation rule over an instruction's or variable's raw string
/// attribute list, checked after Setup.
#[derive(Clone, Debug)]
pub enum Constraint {
    /// The named attribute must be present.
    Exists(String),
    /// The named attribute must be present and parse as the given kind.
    FixedKind(String, ValueKind),
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
    Xor(Box<Constraint>, Box<Constraint>),
    Not(Box<Constraint>),
}

impl Constraint {
    pub fn and(left: Constraint, right: Constraint) -> Constraint {
        Constraint::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Constraint, right: Constraint) -> Constraint {
        Constraint::Or(Box::new(left), Box::new(right))
    }

    pub fn xor(left: Constraint, right: Constraint) -> Constraint {
        Constraint::Xor(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: Constraint) -> Constraint {
        Constraint::Not(Box::new(inner))
    }

    pub fn validate(&self, attributes: &[StringAttribute]) -> bool {
        match self {
            Constraint::Exists(name) => attributes.iter().any(|(n, _)| n == name),
            Constraint::FixedKind(name, kind) => attributes
                .iter()
                .find(|(n, _)| n == name)
                .is_some_and(|(_, value)| kind.parse_literal(value).is_ok()),
            Constraint::And(l, r) => l.validate(attributes) && r.validate(attributes),
            Constraint::Or(l, r) => l.validate(attributes) || r.validate(attributes),
            Constraint::Xor(l, r) => l.validate(attributes) ^ r.validate(attributes),
            Constraint::Not(inner) => !inner.validate(attributes),
        }
    }

    /// Printable form used in setup failure messages.
    pub fn representation(&self) -> String {
        match self {
            Constraint::Exists(name) => format!("Exists({name})"),
            Constraint::FixedKind(name, kind) => {
                format!("Type of ({name}) must be ({kind:?})")
            }
            Constraint::And(l, r) => {
                format!("Both ({}) and ({})", l.representation(), r.representation())
            }
            Constraint::Or(l, r) => {
                format!("({}) or ({})", l.representation(), r.representation())
            }
            Constraint::Xor(l, r) => {
                format!("Either ({}) or ({})", l.representation(), r.representation())
            }
            Constraint::Not(inner) => format!("Not ({})", inner.representation()),
        }
    }
}
