//! The first pass over a source. Reads the declaration directives to find out what class the
//! source declares and what members it has.

use crate::class::ClassDescriptor;
use crate::class::ClassHeader;
use crate::declaration_bail;
use crate::directive::Directive;
use crate::directive::DirectiveKind;
use crate::directive::for_each_line;
use crate::error::Result;
use crate::member::FieldDescriptor;
use crate::member::MethodDescriptor;
use crate::member::Modifiers;
use crate::name::ClassName;
use crate::source::Source;

/// The superclass of a class that doesn't name one.
pub(crate) const DEFAULT_SUPER: &str = "java/lang/Object";

#[tracing::instrument(skip_all, name = "Discover", fields(source = source.name()))]
pub(crate) fn discover(source: &Source) -> Result<ClassDescriptor> {
    let mut header: Option<ClassHeader> = None;
    let mut methods = Vec::new();
    let mut fields = Vec::new();

    for_each_line(source, |line| {
        let Some(directive) = line.directive else {
            return Ok(());
        };
        match directive.kind() {
            DirectiveKind::Class => {
                if let Some(existing) = &header {
                    declaration_bail!(
                        "duplicate class declaration, `{}` was already declared",
                        existing.name
                    );
                }
                header = Some(class_header(&directive)?);
            }
            DirectiveKind::Field => {
                let owner = declared_owner(header.as_ref())?;
                let (signature, _) = split_initial_value(directive.required("sig")?);
                fields.push(FieldDescriptor::parse(
                    owner,
                    signature,
                    member_modifiers(&directive)?,
                )?);
            }
            DirectiveKind::Method => {
                let owner = declared_owner(header.as_ref())?;
                methods.push(MethodDescriptor::parse(
                    owner,
                    directive.required("sig")?,
                    member_modifiers(&directive)?,
                )?);
            }
            _ => {}
        }
        Ok(())
    })?;

    let Some(header) = header else {
        declaration_bail!("missing class declaration in `{}`", source.name());
    };
    tracing::debug!(
        class = %header.name,
        methods = methods.len(),
        fields = fields.len(),
        "Discovered class"
    );
    Ok(ClassDescriptor::new(header, methods, fields))
}

/// Reads the attributes of a `class` directive.
pub(crate) fn class_header(directive: &Directive) -> Result<ClassHeader> {
    let name = ClassName::new(directive.required("name")?);
    let modifiers = member_modifiers(directive)?;
    let super_name = match directive.attribute("super") {
        Some("") => declaration_bail!("`super` attribute of class `{name}` is empty"),
        Some(super_name) => ClassName::new(super_name),
        None => ClassName::new(DEFAULT_SUPER),
    };
    let interfaces = directive
        .attribute("implements")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ClassName::new)
        .collect();
    Ok(ClassHeader {
        name,
        modifiers,
        super_name: Some(super_name),
        interfaces,
    })
}

pub(crate) fn member_modifiers(directive: &Directive) -> Result<Modifiers> {
    Modifiers::parse_keywords(directive.attribute("flags").unwrap_or_default())
}

/// Splits a field signature like `count I = 5` into the signature proper and the initial value.
pub(crate) fn split_initial_value(signature: &str) -> (&str, Option<&str>) {
    match signature.split_once('=') {
        Some((signature, value)) => (signature.trim(), Some(value.trim())),
        None => (signature.trim(), None),
    }
}

fn declared_owner(header: Option<&ClassHeader>) -> Result<&ClassName> {
    match header {
        Some(header) => Ok(&header.name),
        None => declaration_bail!("missing class declaration before member declaration"),
    }
}
