//! Applies plugin-supplied find/replace rules to module source text before the module executes.
//!
//! Patches run in plugin registration order, and every replacement entry operates on the
//! cumulative output of the entries and patches before it. A patch that fails (bad pattern,
//! replacer error, output that no longer compiles) is rolled back on its own; it never affects
//! other plugins' patches or stops the module from registering.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use regex::{Captures, Regex};

use crate::{
    canon,
    registry::{FactoryCompiler, FactoryFn, ModuleId},
};

pub type PredicateFn = Arc<dyn Fn() -> bool + Send + Sync>;
pub type ReplaceFn = Arc<dyn Fn(&Captures) -> eyre::Result<String> + Send + Sync>;

/// Cheap pre-filter deciding whether a module is a candidate for a patch at all, so that the
/// expensive replacement machinery only runs against modules that could plausibly match.
#[derive(Clone, Debug)]
pub enum FindSpec {
    /// Candidate iff the source contains this substring.
    Code(String),
    /// Candidate iff this pattern matches the source.
    Pattern(Regex),
}

impl FindSpec {
    pub fn code(text: impl Into<String>) -> FindSpec {
        FindSpec::Code(text.into())
    }

    pub fn matches(&self, source: &str) -> bool {
        match self {
            FindSpec::Code(text) => source.contains(text.as_str()),
            FindSpec::Pattern(re) => re.is_match(source),
        }
    }
}

impl fmt::Display for FindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindSpec::Code(text) => write!(f, "{text:?}"),
            FindSpec::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// What a replacement entry matches against the source. Literals are canonicalized into escaped
/// regexes so the engine has a single application path. Patterns stay as raw text until
/// canonicalization so that the `\i` shorthand can be expanded before the regex is compiled.
#[derive(Clone, Debug)]
pub enum Matcher {
    Literal(String),
    Pattern(String),
}

/// How the matched text is rewritten: a literal string (supporting `$n`/`$name` group references
/// and the `$self` plugin token), or a fallible function of the captures.
#[derive(Clone)]
pub enum Replacer {
    Literal(String),
    Func(ReplaceFn),
}

/// One find/replace rule within a patch.
#[derive(Clone)]
pub struct Replacement {
    pub matcher: Matcher,
    pub replace: Replacer,
    /// Re-evaluated every time the patch is applied; `false` skips this entry.
    pub predicate: Option<PredicateFn>,
}

impl Replacement {
    pub fn new(matcher: Matcher, replace: Replacer) -> Replacement {
        Replacement {
            matcher,
            replace,
            predicate: None,
        }
    }

    /// Literal find, literal replace.
    pub fn text(find: impl Into<String>, replace: impl Into<String>) -> Replacement {
        Self::new(Matcher::Literal(find.into()), Replacer::Literal(replace.into()))
    }

    /// Regex find, literal replace. The pattern may use the `\i` identifier shorthand.
    pub fn pattern(find: impl Into<String>, replace: impl Into<String>) -> Replacement {
        Self::new(Matcher::Pattern(find.into()), Replacer::Literal(replace.into()))
    }

    /// Regex find with a replacement computed from the captures.
    pub fn dynamic(
        find: impl Into<String>,
        f: impl Fn(&Captures) -> eyre::Result<String> + Send + Sync + 'static,
    ) -> Replacement {
        Self::new(Matcher::Pattern(find.into()), Replacer::Func(Arc::new(f)))
    }

    pub fn when(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Replacement {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

/// A declarative source rewrite contributed by one plugin.
#[derive(Clone)]
pub struct Patch {
    /// Owning plugin, for diagnostics and error attribution.
    pub plugin: String,
    pub find: FindSpec,
    pub replacements: Vec<Replacement>,
    /// Patch-level gate, checked before any entry runs.
    pub predicate: Option<PredicateFn>,
    /// Marks a patch that is expected to hit several modules, silencing the multi-hit notice.
    pub all: bool,
}

impl Patch {
    pub fn new(plugin: impl Into<String>, find: FindSpec) -> Patch {
        Patch {
            plugin: plugin.into(),
            find,
            replacements: Vec::new(),
            predicate: None,
            all: false,
        }
    }

    pub fn replace(mut self, replacement: Replacement) -> Patch {
        self.replacements.push(replacement);
        self
    }

    pub fn when(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Patch {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn all(mut self) -> Patch {
        self.all = true;
        self
    }
}

/// Result of one replacement entry against one module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryOutcome {
    Applied,
    /// Entry predicate returned false.
    SkippedPredicate,
    /// The pattern had no match in the current source. Logged, never thrown.
    NoMatch,
    /// The pattern failed to compile or the replacer function returned an error; the whole
    /// patch is rolled back for this module.
    Failed(String),
    /// The patched source no longer compiled; the patch's changes were reverted.
    RevertedCompile(String),
}

/// Record of one patch's application to one module.
#[derive(Clone, Debug)]
pub struct PatchOutcome {
    pub plugin: String,
    pub module: ModuleId,
    pub entries: Vec<EntryOutcome>,
    pub elapsed: Duration,
    pub source_len: usize,
    pub slow: bool,
}

impl PatchOutcome {
    pub fn failed(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e, EntryOutcome::Failed(_) | EntryOutcome::RevertedCompile(_)))
    }
}

/// A dry run of one patch against source text, for the developer preview tool. Uses the exact
/// same canonicalization and application path as [`apply`].
pub struct Preview {
    pub before: String,
    pub after: String,
    pub outcome: PatchOutcome,
}

/// Previews `patch` against `source` without registering or compiling anything. Returns `None`
/// when the module is not a candidate for the patch.
pub fn preview(id: &ModuleId, source: &str, patch: &Patch) -> Option<Preview> {
    if !patch.find.matches(source) {
        return None;
    }

    let (after, outcome) = apply_single(id, source, patch, Duration::from_millis(u64::MAX));

    Some(Preview {
        before: source.to_string(),
        after,
        outcome,
    })
}

pub(crate) struct ApplyResult {
    /// The final source text after every applicable patch ran.
    pub source: String,
    /// A factory compiled from the final source, when a compiler is available and at least one
    /// patch changed the source.
    pub factory: Option<FactoryFn>,
    pub outcomes: Vec<PatchOutcome>,
    /// Indices into `patches` of every patch whose `find` matched.
    pub hit_patches: Vec<usize>,
}

/// Runs every candidate patch against `original`, in registration order, verifying after each
/// patch that the result still compiles. One plugin's failure never leaks past its own patch.
pub(crate) fn apply(
    id: &ModuleId,
    original: &str,
    patches: &[Arc<Patch>],
    compiler: Option<&dyn FactoryCompiler>,
    slow_threshold: Duration,
) -> ApplyResult {
    let mut source = original.to_string();
    let mut factory = None;
    let mut outcomes = Vec::new();
    let mut hit_patches = Vec::new();
    let mut warned_no_compiler = false;

    for (index, patch) in patches.iter().enumerate() {
        // Candidacy is decided against the text as already mutated by earlier patches; plugins
        // rely on matching code shapes introduced by patches registered before theirs.
        if !patch.find.matches(&source) {
            continue;
        }

        hit_patches.push(index);

        let (patched, mut outcome) = apply_single(id, &source, patch, slow_threshold);

        if patched != source {
            match compiler {
                Some(compiler) => match compiler.compile(id, &patched) {
                    Ok(compiled) => {
                        source = patched;
                        factory = Some(compiled);
                    }
                    Err(err) => {
                        log::error!(
                            "patch from {} broke module {id}, reverting: {err}",
                            patch.plugin
                        );
                        outcome.entries.push(EntryOutcome::RevertedCompile(err.to_string()));
                    }
                },
                None => {
                    source = patched;

                    if !warned_no_compiler {
                        log::warn!(
                            "module {id} was patched but no compiler is installed; the original \
                             factory will run"
                        );
                        warned_no_compiler = true;
                    }
                }
            }
        }

        if outcome.slow {
            log::warn!(
                "slow patch: {} took {:?} on module {id} ({} bytes)",
                patch.plugin,
                outcome.elapsed,
                outcome.source_len
            );
        }

        outcomes.push(outcome);
    }

    ApplyResult {
        source,
        factory,
        outcomes,
        hit_patches,
    }
}

/// Applies a single patch to `source`, returning the new text and the outcome record. A failed
/// entry rolls the whole patch back, leaving the input text untouched.
fn apply_single(
    id: &ModuleId,
    source: &str,
    patch: &Patch,
    slow_threshold: Duration,
) -> (String, PatchOutcome) {
    let started = Instant::now();
    let mut entries = Vec::with_capacity(patch.replacements.len());
    let mut current = source.to_string();
    let mut failed = false;

    let gated = patch
        .predicate
        .as_ref()
        .map_or(false, |predicate| !predicate());

    if gated {
        entries.extend(
            patch
                .replacements
                .iter()
                .map(|_| EntryOutcome::SkippedPredicate),
        );
    } else {
        for replacement in &patch.replacements {
            if replacement
                .predicate
                .as_ref()
                .map_or(false, |predicate| !predicate())
            {
                entries.push(EntryOutcome::SkippedPredicate);
                continue;
            }

            let re = match canon::canonicalize_match(&replacement.matcher) {
                Ok(re) => re,
                Err(err) => {
                    entries.push(EntryOutcome::Failed(format!("bad pattern: {err}")));
                    failed = true;
                    break;
                }
            };

            let replace = canon::canonicalize_replace(&replacement.replace, &patch.plugin);

            match apply_one(&re, &replace, &current) {
                Ok(Some(next)) => {
                    current = next;
                    entries.push(EntryOutcome::Applied);
                }
                Ok(None) => {
                    log::debug!(
                        "patch from {}: /{}/ had no match in module {id}",
                        patch.plugin,
                        re.as_str()
                    );
                    entries.push(EntryOutcome::NoMatch);
                }
                Err(err) => {
                    log::error!(
                        "patch from {} failed on module {id}: {err:?}",
                        patch.plugin
                    );
                    entries.push(EntryOutcome::Failed(err.to_string()));
                    failed = true;
                    break;
                }
            }
        }
    }

    if failed {
        current = source.to_string();
    }

    let elapsed = started.elapsed();

    let outcome = PatchOutcome {
        plugin: patch.plugin.clone(),
        module: id.clone(),
        entries,
        elapsed,
        source_len: source.len(),
        slow: elapsed >= slow_threshold,
    };

    (current, outcome)
}

/// Applies one canonicalized replacement to the source. `Ok(None)` means the pattern had no
/// match. Only the first match is rewritten, mirroring non-global replace semantics.
fn apply_one(re: &Regex, replace: &Replacer, source: &str) -> eyre::Result<Option<String>> {
    let caps = match re.captures(source) {
        Some(caps) => caps,
        None => return Ok(None),
    };

    let Some(whole) = caps.get(0) else {
        return Ok(None);
    };

    let mut replaced = String::new();

    match replace {
        Replacer::Literal(text) => caps.expand(text, &mut replaced),
        Replacer::Func(f) => replaced = f(&caps)?,
    }

    let mut out = String::with_capacity(source.len() + replaced.len());
    out.push_str(&source[..whole.start()]);
    out.push_str(&replaced);
    out.push_str(&source[whole.end()..]);

    Ok(Some(out))
}
