//! Normalizes user-authored match and replacement forms into the exact shape the engine runs,
//! so that the engine and the patch preview tool always agree on what a patch will do.

use lazy_static::lazy_static;
use regex::{NoExpand, Regex};

use crate::patcher::{Matcher, Replacer};

/// What the `\i` shorthand expands to: one identifier, in a non-capturing group so that user
/// group numbering stays stable.
pub const IDENT_PATTERN: &str = r"(?:[A-Za-z_$][\w$]*)";

/// Token in literal replacements that refers to the owning plugin.
pub const SELF_TOKEN: &str = "$self";

lazy_static! {
    static ref IDENT_SHORTHAND: Regex = Regex::new(r"\\i").unwrap();
}

/// The accessor a replacement's `$self` token expands to.
pub fn self_reference(plugin: &str) -> String {
    format!("__graft.plugin(\"{plugin}\")")
}

/// Expands the `\i` identifier shorthand in a regex pattern. Idempotent: the expansion contains
/// no `\i`, so a second pass is the identity.
pub fn canonical_pattern(pattern: &str) -> String {
    IDENT_SHORTHAND
        .replace_all(pattern, NoExpand(IDENT_PATTERN))
        .into_owned()
}

/// Normalizes a matcher into the regex the engine will actually run. Literal matchers are
/// escaped; patterns get the `\i` shorthand expanded before compilation, since `\i` is not a
/// regex escape the compiler itself would accept.
pub fn canonicalize_match(matcher: &Matcher) -> Result<Regex, regex::Error> {
    match matcher {
        Matcher::Literal(text) => Regex::new(&regex::escape(text)),
        Matcher::Pattern(raw) => Regex::new(&canonical_pattern(raw)),
    }
}

/// Normalizes a replacement: literal replacements get `$self` expanded to the plugin accessor,
/// before any capture-group expansion happens. Function replacers pass through untouched.
pub fn canonicalize_replace(replace: &Replacer, plugin: &str) -> Replacer {
    match replace {
        Replacer::Literal(text) => {
            Replacer::Literal(text.replace(SELF_TOKEN, &self_reference(plugin)))
        }
        Replacer::Func(f) => Replacer::Func(f.clone()),
    }
}
