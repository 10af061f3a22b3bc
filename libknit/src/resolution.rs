//! The second pass over a source. Resolves each reference directive and records which other
//! classes the source depends on, so that the rewrite pass can generate glue fields for them.

use crate::class::ClassDescriptor;
use crate::declaration_bail;
use crate::directive::Directive;
use crate::directive::DirectiveKind;
use crate::directive::for_each_line;
use crate::error::LinkError;
use crate::error::Result;
use crate::error::SourceLocation;
use crate::error::with_location;
use crate::line_table::LineTable;
use crate::name::ClassName;
use crate::reference::FieldReference;
use crate::reference::MethodReference;
use crate::resolver::Resolver;
use crate::source::Source;
use foldhash::HashSet;
use indexmap::IndexMap;
use std::sync::Arc;

const GLUE_PREFIX: &str = "glue$";

/// What a directive line resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The start of an invocation whose end hasn't been seen yet. Never present once a pass has
    /// completed successfully.
    Unpaired,
    /// Both the begin and end lines of an invocation map to the invoked method.
    Invocation(MethodReference),
    FieldRead(FieldReference),
    /// The owner of a method, for `class-of`.
    ClassName(ClassName),
}

/// The classes that a source depends on, each with the name of the field that will hold it. The
/// execution context is always the first entry.
#[derive(Debug, Clone)]
pub struct GlueFields {
    context: ClassName,
    fields: IndexMap<ClassName, String>,
    issued: HashSet<String>,
}

#[derive(Debug)]
pub struct Resolution {
    pub class: Arc<ClassDescriptor>,
    pub lines: LineTable<Resolved>,
    pub glue: GlueFields,
}

impl GlueFields {
    pub(crate) fn new(context: ClassName) -> Self {
        let mut glue = GlueFields {
            context: context.clone(),
            fields: IndexMap::new(),
            issued: HashSet::default(),
        };
        glue.record(&context);
        glue
    }

    /// Records a dependency on `owner` if it isn't already recorded. Names are made unique by
    /// appending the number of dependencies recorded before this one, so `pkg1/Foo` and
    /// `pkg2/Foo` get different fields. A simple name ending in a digit can still produce a name
    /// that's already taken (`Foo1` then `Foo` at 11), in which case the counter is bumped until
    /// the name is free.
    pub(crate) fn record(&mut self, owner: &ClassName) {
        if self.fields.contains_key(owner) {
            return;
        }
        let stem = owner.simple_name().to_lowercase();
        let mut counter = self.fields.len();
        let name = loop {
            let candidate = format!("{GLUE_PREFIX}{stem}{counter}");
            if !self.issued.contains(&candidate) {
                break candidate;
            }
            counter += 1;
        };
        self.issued.insert(name.clone());
        self.fields.insert(owner.clone(), name);
    }

    pub fn context(&self) -> &ClassName {
        &self.context
    }

    pub fn get(&self, owner: &ClassName) -> Option<&str> {
        self.fields.get(owner).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClassName, &str)> {
        self.fields
            .iter()
            .map(|(owner, field)| (owner, field.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[tracing::instrument(skip_all, name = "Resolve", fields(source = source.name()))]
pub(crate) fn resolve_source(
    source: &Source,
    class: &Arc<ClassDescriptor>,
    resolver: &Resolver,
    context: &ClassName,
) -> Result<Resolution> {
    let mut lines = LineTable::new();
    let mut glue = GlueFields::new(context.clone());
    let mut open_invocations = Vec::new();

    let mut record = |owner: &ClassName, is_local: bool| {
        if !is_local && owner != class.name() {
            glue.record(owner);
        }
    };

    for_each_line(source, |line| {
        let Some(directive) = line.directive else {
            return Ok(());
        };
        match directive.kind() {
            DirectiveKind::InvokeBegin => {
                has_pending_operand(&directive)?;
                lines.add(line.number, Resolved::Unpaired)?;
                open_invocations.push(line.number);
            }
            DirectiveKind::InvokeEnd => {
                let signature = directive.required("sig")?;
                let reference = if directive.flag("local")? {
                    resolver.resolve_local_method(signature, class)?
                } else {
                    resolver.resolve_method(signature, class)?
                };
                record(reference.owner(), reference.is_local());
                let Some(begin) = open_invocations.pop() else {
                    declaration_bail!("`;@invoke-end` without a matching `;@invoke-begin`");
                };
                lines.replace(begin, Resolved::Invocation(reference.clone()))?;
                lines.add(line.number, Resolved::Invocation(reference))?;
            }
            DirectiveKind::ReadField => {
                let signature = directive.required("sig")?;
                let reference = if directive.flag("local")? {
                    resolver.resolve_local_field(signature, class)?
                } else {
                    resolver.resolve_field(signature, class)?
                };
                record(reference.owner(), reference.is_local());
                lines.add(line.number, Resolved::FieldRead(reference))?;
            }
            DirectiveKind::ClassOf => {
                let signature = directive.required("sig")?;
                let reference = resolver.resolve_method(signature, class)?;
                lines.add(line.number, Resolved::ClassName(reference.owner().clone()))?;
            }
            _ => {}
        }
        Ok(())
    })?;

    if let Some(&begin) = open_invocations.first() {
        let error = LinkError::Declaration(
            "`;@invoke-begin` without a matching `;@invoke-end`".to_owned(),
        );
        return Err(with_location(error.into(), || SourceLocation {
            source: source.name().to_owned(),
            line: begin,
        }));
    }

    tracing::debug!(
        directives = lines.len(),
        dependencies = glue.len() - 1,
        "Resolved source"
    );
    Ok(Resolution {
        class: class.clone(),
        lines,
        glue,
    })
}

/// Reads the `pending` attribute of an `invoke-begin` directive, which says whether an operand
/// was already pushed before the receiver needed to be loaded.
pub(crate) fn has_pending_operand(directive: &Directive) -> Result<bool> {
    match directive.number("pending", 0)? {
        0 => Ok(false),
        1 => Ok(true),
        other => declaration_bail!("`pending` must be 0 or 1, got {other}"),
    }
}
