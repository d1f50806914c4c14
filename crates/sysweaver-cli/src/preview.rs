//! Condensed display of buffered script output

use std::fmt;

/// Output shorter than this is always shown in full.
pub const FULL_OUTPUT_LIMIT: usize = 500;

/// Longer output is abbreviated only when it has more lines than this.
pub const PREVIEW_MIN_LINES: usize = 10;

/// Lines kept from each end of an abbreviated output.
pub const PREVIEW_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    Empty,
    Full(String),
    Abbreviated { head: Vec<String>, tail: Vec<String> },
}

impl Preview {
    #[must_use]
    pub fn of(output: &[u8]) -> Self {
        if output.is_empty() {
            return Self::Empty;
        }
        let text = String::from_utf8_lossy(output);
        let text = text.strip_suffix('\n').unwrap_or(&*text);
        if output.len() < FULL_OUTPUT_LIMIT {
            return Self::Full(text.to_owned());
        }

        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() <= PREVIEW_MIN_LINES {
            return Self::Full(text.to_owned());
        }
        Self::Abbreviated {
            head: lines[..PREVIEW_LINES].iter().map(|l| (*l).to_owned()).collect(),
            tail: lines[lines.len() - PREVIEW_LINES..]
                .iter()
                .map(|l| (*l).to_owned())
                .collect(),
        }
    }
}

impl fmt::Display for Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Full(text) => {
                writeln!(f, "--- Output begin ---")?;
                writeln!(f, "{text}")?;
                writeln!(f, "--- Output end ---")
            }
            Self::Abbreviated { head, tail } => {
                writeln!(f, "--- Output preview (use --verbose for full output) ---")?;
                for line in head {
                    writeln!(f, "{line}")?;
                }
                writeln!(f, "...")?;
                for line in tail {
                    writeln!(f, "{line}")?;
                }
                writeln!(f, "--- End of preview ---")
            }
        }
    }
}
