//! Template parsing contexts.

use std::fmt;

/// The lexical region a template fragment belongs to.
///
/// The context constrains which statements are legal during parsing and is
/// propagated to the produced nodes so a later escaping stage can pick the
/// right writer. `None` selects program mode, where the source is code
/// rather than a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Context {
    /// Program mode: the source is code, not a template.
    #[default]
    None,
    /// Plain text, no escaping.
    Text,
    /// HTML body.
    Html,
    /// CSS block.
    Css,
    /// Script tag.
    Script,
    /// Quoted HTML attribute value.
    Attribute,
    /// Unquoted HTML attribute value.
    UnquotedAttribute,
}

impl Context {
    /// Whether this context is a valid entry context for parsing.
    ///
    /// Attribute contexts only occur on tokens produced inside a tag; a
    /// source file cannot start in one.
    #[inline]
    #[must_use]
    pub const fn is_entry(self) -> bool {
        matches!(
            self,
            Context::None | Context::Text | Context::Html | Context::Css | Context::Script
        )
    }

    /// The context name as it appears in diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Context::None => "none",
            Context::Text => "text",
            Context::Html => "HTML",
            Context::Css => "CSS",
            Context::Script => "script",
            Context::Attribute => "attribute",
            Context::UnquotedAttribute => "unquoted attribute",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_contexts() {
        assert!(Context::None.is_entry());
        assert!(Context::Html.is_entry());
        assert!(!Context::Attribute.is_entry());
        assert!(!Context::UnquotedAttribute.is_entry());
    }

    #[test]
    fn test_display() {
        assert_eq!(Context::Css.to_string(), "CSS");
        assert_eq!(Context::UnquotedAttribute.to_string(), "unquoted attribute");
    }
}
