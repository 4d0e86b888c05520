#![forbid(unsafe_code)]

//! Tag-string grammar for ControlLogix symbolic addresses.
//!
//! `tag = name ("." name | "[" integer "]")*` — e.g. `MyUDT.Field[3].Sub`.
//! Array indices follow C integer rules for compatibility with existing
//! databases: a leading `0x`/`0X` means hexadecimal, a leading `0` octal,
//! anything else decimal.

use std::fmt;
use std::str::FromStr;

use crate::error::{EipError, Result};

/// One step of a parsed tag path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSegment {
    /// Symbolic member name, never empty.
    Name(String),
    /// Array element index.
    Element(u32),
}

/// Parsed tag, an ordered segment list starting with a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPath {
    segments: Vec<TagSegment>,
}

impl TagPath {
    pub fn segments(&self) -> &[TagSegment] {
        &self.segments
    }
}

impl FromStr for TagPath {
    type Err = EipError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(EipError::Parse("empty tag".into()));
        }
        let mut segments = Vec::new();
        let mut rest = s;
        loop {
            if let Some(after) = rest.strip_prefix('[') {
                if segments.is_empty() {
                    return Err(EipError::Parse(format!(
                        "tag '{s}' must start with a name, not an index"
                    )));
                }
                let close = after.find(']').ok_or_else(|| {
                    EipError::Parse(format!("tag '{s}' has an unclosed ']'"))
                })?;
                let idx = parse_c_uint(&after[..close]).ok_or_else(|| {
                    EipError::Parse(format!(
                        "tag '{s}' has a bad array index '{}'",
                        &after[..close]
                    ))
                })?;
                segments.push(TagSegment::Element(idx));
                rest = &after[close + 1..];
            } else {
                let rest_after_dot = if segments.is_empty() {
                    rest
                } else {
                    // after a name the cursor sits on '.' or '['; anything
                    // else can only follow a ']'
                    rest.strip_prefix('.').ok_or_else(|| {
                        EipError::Parse(format!("tag '{s}' has garbage after ']'"))
                    })?
                };
                let end = rest_after_dot
                    .find(['.', '['])
                    .unwrap_or(rest_after_dot.len());
                if end == 0 {
                    return Err(EipError::Parse(format!(
                        "tag '{s}' has an empty name segment"
                    )));
                }
                segments.push(TagSegment::Name(rest_after_dot[..end].to_string()));
                rest = &rest_after_dot[end..];
            }
            if rest.is_empty() {
                break;
            }
        }
        Ok(TagPath { segments })
    }
}

impl fmt::Display for TagPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                TagSegment::Name(n) if i == 0 => write!(f, "{n}")?,
                TagSegment::Name(n) => write!(f, ".{n}")?,
                TagSegment::Element(e) => write!(f, "[{e}]")?,
            }
        }
        Ok(())
    }
}

/// `atol`-style unsigned parse: `0x` hex, leading `0` octal, else decimal.
fn parse_c_uint(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> TagPath {
        s.parse().unwrap()
    }

    #[test]
    fn single_name() {
        assert_eq!(
            parse("fred").segments(),
            &[TagSegment::Name("fred".into())]
        );
    }

    #[test]
    fn module_style_names_keep_colons() {
        let t = parse("Local:2:I.Ch0Data");
        assert_eq!(
            t.segments(),
            &[
                TagSegment::Name("Local:2:I".into()),
                TagSegment::Name("Ch0Data".into()),
            ]
        );
    }

    #[test]
    fn nested_array_members() {
        let t = parse("a[1].b[2][3].c");
        assert_eq!(
            t.segments(),
            &[
                TagSegment::Name("a".into()),
                TagSegment::Element(1),
                TagSegment::Name("b".into()),
                TagSegment::Element(2),
                TagSegment::Element(3),
                TagSegment::Name("c".into()),
            ]
        );
    }

    #[test]
    fn c_integer_rules() {
        assert_eq!(parse("a[0x10]").segments()[1], TagSegment::Element(16));
        assert_eq!(parse("a[010]").segments()[1], TagSegment::Element(8));
        assert_eq!(parse("a[10]").segments()[1], TagSegment::Element(10));
        assert_eq!(parse("a[0]").segments()[1], TagSegment::Element(0));
    }

    #[test]
    fn rejects_malformed() {
        assert!("".parse::<TagPath>().is_err());
        assert!("[3]".parse::<TagPath>().is_err());
        assert!("a[3".parse::<TagPath>().is_err());
        assert!("a..b".parse::<TagPath>().is_err());
        assert!("a.".parse::<TagPath>().is_err());
        assert!("a[x]".parse::<TagPath>().is_err());
        assert!("a[1]b".parse::<TagPath>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["fred", "a[1].b[2][3].c", "Local:2:I.Ch0Data"] {
            assert_eq!(parse(s).to_string(), s);
        }
    }
}
