//! Message-type registry.
//!
//! A message type couples a wire prefix (`MSG`, `SYS`, ...) with a render
//! template for the chat surface and a derived wire encoding. Two built-in
//! types always exist and cannot be removed: `MSG` for relayed chat and
//! `SYS` for operator-visible notices.

use std::collections::HashMap;

use crate::error::{BridgeError, BridgeResult};
use crate::wire::{escape, FIELD_SEP};

/// Built-in chat message type (sendable).
pub const MSG_PREFIX: &str = "MSG";
/// Built-in system notice type (not sendable — never relayed outward).
pub const SYS_PREFIX: &str = "SYS";

/// An immutable message format record.
///
/// `formatfields` and `encoding` are derived from `formatstr` and `prefix`
/// at construction and are never loaded from persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageType {
    /// Unique short wire tag, e.g. `MSG`.
    pub prefix: String,
    /// Render template with `{name}` placeholders.
    pub formatstr: String,
    /// Placeholder names in order of appearance.
    pub formatfields: Vec<String>,
    /// Whether this type may be relayed outward to clients at all.
    pub sendable: bool,
    /// Wire template: `prefix::{f1}::{f2}::...::\n`.
    pub encoding: String,
}

impl MessageType {
    /// Build a type, deriving `formatfields` and `encoding`.
    pub fn new(prefix: &str, formatstr: &str, sendable: bool) -> BridgeResult<Self> {
        if prefix.is_empty() {
            return Err(BridgeError::Validation("empty type prefix".into()));
        }
        if prefix.contains(FIELD_SEP) {
            return Err(BridgeError::Validation(format!(
                "type prefix may not contain the field separator: {prefix:?}"
            )));
        }

        let formatfields = placeholder_fields(formatstr);
        let mut encoding = String::from(prefix);
        for field in &formatfields {
            encoding.push_str(FIELD_SEP);
            encoding.push('{');
            encoding.push_str(field);
            encoding.push('}');
        }
        encoding.push_str(FIELD_SEP);
        encoding.push('\n');

        Ok(Self {
            prefix: prefix.to_string(),
            formatstr: formatstr.to_string(),
            formatfields,
            sendable,
            encoding,
        })
    }

    /// Render field values into the human-readable template.
    ///
    /// Values map onto `formatfields` positionally. A missing value leaves
    /// its placeholder position empty — a short line is a partial render,
    /// not an error. Surplus values are ignored.
    pub fn render(&self, values: &[&str]) -> String {
        let mut out = self.formatstr.clone();
        for (i, field) in self.formatfields.iter().enumerate() {
            let value = values.get(i).copied().unwrap_or("");
            out = out.replace(&format!("{{{field}}}"), value);
        }
        out
    }

    /// Encode field values into a wire line, escaping each value first.
    pub fn encode(&self, values: &[&str]) -> String {
        let mut out = self.encoding.clone();
        for (i, field) in self.formatfields.iter().enumerate() {
            let value = values.get(i).map(|v| escape(v)).unwrap_or_default();
            out = out.replace(&format!("{{{field}}}"), &value);
        }
        out
    }
}

/// Extract `{name}` placeholder names in order of appearance.
///
/// Only word characters count as a name; anything else (stray braces,
/// spaces) is skipped rather than rejected.
fn placeholder_fields(formatstr: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut rest = formatstr;
    while let Some(open) = rest.find('{') {
        rest = &rest[open + 1..];
        let Some(close) = rest.find('}') else { break };
        let name = &rest[..close];
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            fields.push(name.to_string());
        }
        rest = &rest[close + 1..];
    }
    fields
}

/// Registry of named message formats.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: HashMap<String, MessageType>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a registry holding the two built-in types.
    pub fn new() -> Self {
        let mut registry = Self {
            types: HashMap::new(),
        };
        // The built-in templates are well-formed; construction cannot fail.
        for (prefix, formatstr, sendable) in [
            (MSG_PREFIX, "[**{client}**] {user}: {content}", true),
            (SYS_PREFIX, "{content}", false),
        ] {
            if let Ok(ty) = MessageType::new(prefix, formatstr, sendable) {
                registry.types.insert(ty.prefix.clone(), ty);
            }
        }
        registry
    }

    /// Register (or overwrite — upsert) a message type.
    pub fn register(
        &mut self,
        prefix: &str,
        formatstr: &str,
        sendable: bool,
    ) -> BridgeResult<MessageType> {
        let ty = MessageType::new(prefix, formatstr, sendable)?;
        self.types.insert(ty.prefix.clone(), ty.clone());
        Ok(ty)
    }

    /// Remove a message type. The built-ins can only be modified, never
    /// removed.
    pub fn remove(&mut self, prefix: &str) -> BridgeResult<()> {
        if prefix == MSG_PREFIX || prefix == SYS_PREFIX {
            return Err(BridgeError::Protected(prefix.to_string()));
        }
        if self.types.remove(prefix).is_none() {
            return Err(BridgeError::NotFound(format!("message type {prefix}")));
        }
        Ok(())
    }

    /// Look up a type by prefix.
    pub fn lookup(&self, prefix: &str) -> BridgeResult<&MessageType> {
        self.types
            .get(prefix)
            .ok_or_else(|| BridgeError::NotFound(format!("message type {prefix}")))
    }

    /// Non-failing lookup for hot paths.
    pub fn get(&self, prefix: &str) -> Option<&MessageType> {
        self.types.get(prefix)
    }

    /// Whether a prefix is registered.
    pub fn contains(&self, prefix: &str) -> bool {
        self.types.contains_key(prefix)
    }

    /// Iterate over all registered types.
    pub fn iter(&self) -> impl Iterator<Item = &MessageType> {
        self.types.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_derives_fields_in_order() {
        let mut registry = TypeRegistry::new();
        let ty = registry
            .register("T", "[{client}] {user}: {content}", true)
            .unwrap();
        assert_eq!(ty.formatfields, vec!["client", "user", "content"]);
        assert_eq!(ty.encoding, "T::{client}::{user}::{content}::\n");
    }

    #[test]
    fn register_rejects_bad_prefix() {
        let mut registry = TypeRegistry::new();
        assert!(matches!(
            registry.register("", "{content}", true),
            Err(BridgeError::Validation(_))
        ));
        assert!(matches!(
            registry.register("A::B", "{content}", true),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn register_is_an_upsert() {
        let mut registry = TypeRegistry::new();
        registry.register("JOIN", "{user} joined", true).unwrap();
        registry.register("JOIN", "{user} arrived on {client}", false).unwrap();
        let ty = registry.lookup("JOIN").unwrap();
        assert_eq!(ty.formatfields, vec!["user", "client"]);
        assert!(!ty.sendable);
    }

    #[test]
    fn builtins_exist_and_are_protected() {
        let mut registry = TypeRegistry::new();
        assert!(registry.lookup(MSG_PREFIX).unwrap().sendable);
        assert!(!registry.lookup(SYS_PREFIX).unwrap().sendable);
        assert!(matches!(
            registry.remove(MSG_PREFIX),
            Err(BridgeError::Protected(_))
        ));
        assert!(matches!(
            registry.remove(SYS_PREFIX),
            Err(BridgeError::Protected(_))
        ));
        assert!(matches!(
            registry.remove("NOPE"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn render_tolerates_missing_values() {
        let registry = TypeRegistry::new();
        let msg = registry.lookup(MSG_PREFIX).unwrap();
        assert_eq!(
            msg.render(&["Survival", "Alice", "hello"]),
            "[**Survival**] Alice: hello"
        );
        // Short lines render partially instead of failing.
        assert_eq!(msg.render(&["Survival"]), "[**Survival**] : ");
    }

    #[test]
    fn encode_escapes_values() {
        let registry = TypeRegistry::new();
        let msg = registry.lookup(MSG_PREFIX).unwrap();
        let line = msg.encode(&["Survival", "Al::ice", "two\nlines"]);
        assert_eq!(line, "MSG::Survival::Al:\\:ice::two\\nlines::\n");
    }

    #[test]
    fn placeholder_extraction_skips_non_names() {
        assert_eq!(
            placeholder_fields("{a} {} {b c} {d_2}"),
            vec!["a".to_string(), "d_2".to_string()]
        );
    }
}
