use serde::{Deserialize, Serialize};

/// Log severities on the syslog scale.
///
/// Higher-severity messages have *lower* numeric values: `Emergency` is 0 and
/// `Trace` is 8. Any wire format must preserve this ordering convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
    Trace = 8,
}

const SEVERITY_NAMES: [(Severity, &str); 9] = [
    (Severity::Emergency, "EMERGENCY"),
    (Severity::Alert, "ALERT"),
    (Severity::Critical, "CRITICAL"),
    (Severity::Error, "ERROR"),
    (Severity::Warning, "WARNING"),
    (Severity::Notice, "NOTICE"),
    (Severity::Info, "INFO"),
    (Severity::Debug, "DEBUG"),
    (Severity::Trace, "TRACE"),
];

impl Severity {
    pub fn as_str(&self) -> &'static str {
        SEVERITY_NAMES
            .iter()
            .find(|(s, _)| s == self)
            .map(|(_, n)| *n)
            .unwrap_or("UNKNOWN")
    }

    /// Resolve a severity from its canonical upper-case name.
    pub fn from_name(name: &str) -> Option<Severity> {
        SEVERITY_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(s, _)| *s)
    }

    pub fn from_code(code: u8) -> Option<Severity> {
        SEVERITY_NAMES.get(code as usize).map(|(s, _)| *s)
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_order_is_preserved() {
        assert_eq!(Severity::Emergency.code(), 0);
        assert_eq!(Severity::Trace.code(), 8);
        assert!(Severity::Emergency < Severity::Error);
    }

    #[test]
    fn names_round_trip() {
        for code in 0..=8 {
            let severity = Severity::from_code(code).unwrap();
            assert_eq!(Severity::from_name(severity.as_str()), Some(severity));
        }
        assert_eq!(Severity::from_name("bogus"), None);
        assert_eq!(Severity::from_code(9), None);
    }
}
