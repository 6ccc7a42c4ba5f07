use std::time::Duration;

/// Upper bound on a cooperative blocking slice. Every blocking leaf structures
/// its wait as a loop over this interval so halt responsiveness is independent
/// of the requested timeout.
pub const TIMING_ACCURACY: Duration = Duration::from_millis(20);

/// Idle backoff between ticks when the root reported not-finished with no
/// running leaves.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_millis(100);

// Attribute names shared by several instructions.
pub const TIMEOUT_ATTRIBUTE: &str = "timeout";
pub const DESCRIPTION_ATTRIBUTE: &str = "description";
pub const INPUT_VARIABLE_ATTRIBUTE: &str = "inputVar";
pub const OUTPUT_VARIABLE_ATTRIBUTE: &str = "outputVar";
pub const VARIABLE_NAME_ATTRIBUTE: &str = "varName";

/// Separators accepted between entries of a variable-name list attribute.
pub const VARNAME_DELIMITERS: [char; 2] = [' ', ','];
