//! Descriptions of declared members (methods and fields) and the textual signatures that name
//! them.
//!
//! A method signature looks like `name(params)ret`, optionally prefixed with an owner, e.g.
//! `pkg/A/f(IJ)V`. A field signature looks like `name type`, e.g. `count I` or `pkg/A/count I`.

use crate::declaration_bail;
use crate::error::Result;
use crate::name::ClassName;
use bitflags::bitflags;
use std::fmt::Display;

bitflags! {
    /// Modifier flags of a class or member. The bit values match those used by the binary
    /// class-file format, so flags read by the metadata loader can be used directly. Some bits
    /// mean different things depending on what they're attached to (e.g. 0x0020 is
    /// `synchronized` on a method but `super` on a class). We only ever print the method / field
    /// meaning.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

/// Keywords in the order that the assembler expects them.
const KEYWORDS: &[(&str, Modifiers)] = &[
    ("public", Modifiers::PUBLIC),
    ("private", Modifiers::PRIVATE),
    ("protected", Modifiers::PROTECTED),
    ("static", Modifiers::STATIC),
    ("final", Modifiers::FINAL),
    ("synchronized", Modifiers::SYNCHRONIZED),
    ("volatile", Modifiers::VOLATILE),
    ("transient", Modifiers::TRANSIENT),
    ("native", Modifiers::NATIVE),
    ("interface", Modifiers::INTERFACE),
    ("abstract", Modifiers::ABSTRACT),
    ("strict", Modifiers::STRICT),
    ("synthetic", Modifiers::SYNTHETIC),
    ("annotation", Modifiers::ANNOTATION),
    ("enum", Modifiers::ENUM),
];

impl Modifiers {
    /// Parses a whitespace-separated list of modifier keywords.
    pub fn parse_keywords(text: &str) -> Result<Modifiers> {
        let mut modifiers = Modifiers::empty();
        for word in text.split_whitespace() {
            let Some((_, flag)) = KEYWORDS.iter().find(|(keyword, _)| *keyword == word) else {
                declaration_bail!("unknown modifier `{word}`");
            };
            modifiers |= *flag;
        }
        Ok(modifiers)
    }

    pub fn is_public(self) -> bool {
        self.contains(Modifiers::PUBLIC)
    }

    pub fn is_private(self) -> bool {
        self.contains(Modifiers::PRIVATE)
    }

    pub fn is_static(self) -> bool {
        self.contains(Modifiers::STATIC)
    }

    pub fn is_interface(self) -> bool {
        self.contains(Modifiers::INTERFACE)
    }

    /// Returns something that displays as the space-separated keywords for these flags, leaving
    /// out any that are in `exclude`.
    pub fn keywords(self, exclude: Modifiers) -> impl Display {
        ModifierKeywords(self.difference(exclude))
    }
}

struct ModifierKeywords(Modifiers);

impl Display for ModifierKeywords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (keyword, flag) in KEYWORDS {
            if self.0.contains(*flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(keyword)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A signature split into its parts. The owner is only present if the signature was qualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberSignature<'a> {
    pub owner: Option<&'a str>,
    pub name: &'a str,
    /// For methods, the parenthesised parameters and return type. For fields, the field type.
    pub descriptor: &'a str,
}

impl<'a> MemberSignature<'a> {
    /// Splits a method signature such as `pkg/A/f(I)V`. The owner separator is the rightmost `/`
    /// or `.` before the parameter list.
    pub fn parse_method(text: &'a str) -> Result<MemberSignature<'a>> {
        let text = text.trim();
        let Some(paren) = text.find('(') else {
            declaration_bail!("malformed method signature `{text}`: missing parameter list");
        };
        let (qualified_name, descriptor) = text.split_at(paren);
        let (owner, name) = split_owner(qualified_name, text)?;
        validate_member_name(name, text)?;
        validate_method_descriptor(descriptor)
            .map_err(|e| e.context(format!("malformed method signature `{text}`")))?;
        Ok(MemberSignature {
            owner,
            name,
            descriptor,
        })
    }

    /// Splits a field signature such as `pkg/A/count I`. The type marker is the whitespace that
    /// separates the name from the type.
    pub fn parse_field(text: &'a str) -> Result<MemberSignature<'a>> {
        let text = text.trim();
        let Some((qualified_name, field_type)) = text.split_once(char::is_whitespace) else {
            declaration_bail!("malformed field signature `{text}`: missing type");
        };
        let field_type = field_type.trim();
        let (owner, name) = split_owner(qualified_name, text)?;
        validate_member_name(name, text)?;
        let rest = parse_field_type(field_type)
            .map_err(|e| e.context(format!("malformed field signature `{text}`")))?;
        if !rest.is_empty() {
            declaration_bail!("malformed field signature `{text}`: trailing `{rest}`");
        }
        Ok(MemberSignature {
            owner,
            name,
            descriptor: field_type,
        })
    }

    /// The signature without any owner. This is the key used for member lookup tables.
    pub fn unqualified(&self, kind: MemberKind) -> String {
        match kind {
            MemberKind::Method => format!("{}{}", self.name, self.descriptor),
            MemberKind::Field => format!("{} {}", self.name, self.descriptor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Field,
}

fn split_owner<'a>(
    qualified_name: &'a str,
    signature: &str,
) -> Result<(Option<&'a str>, &'a str)> {
    let Some(separator) = qualified_name.rfind(['/', '.']) else {
        return Ok((None, qualified_name));
    };
    let owner = &qualified_name[..separator];
    if owner.is_empty() {
        declaration_bail!("malformed signature `{signature}`: empty owner");
    }
    Ok((Some(owner), &qualified_name[separator + 1..]))
}

fn validate_member_name(name: &str, signature: &str) -> Result {
    if name.is_empty() {
        declaration_bail!("malformed signature `{signature}`: empty member name");
    }
    if let Some(bad) = name.chars().find(|ch| ";[()/. \t".contains(*ch)) {
        declaration_bail!("malformed signature `{signature}`: `{bad}` in member name");
    }
    Ok(())
}

/// Parses one field type from the start of `descriptor`, returning what follows it.
fn parse_field_type(descriptor: &str) -> Result<&str> {
    let rest = descriptor.trim_start_matches('[');
    let mut chars = rest.chars();
    match chars.next() {
        Some('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => Ok(chars.as_str()),
        Some('L') => {
            let Some(end) = rest.find(';') else {
                declaration_bail!("unterminated class type in `{descriptor}`");
            };
            if end == 1 {
                declaration_bail!("empty class type in `{descriptor}`");
            }
            Ok(&rest[end + 1..])
        }
        Some(other) => declaration_bail!("invalid type code `{other}` in `{descriptor}`"),
        None => declaration_bail!("missing type in `{descriptor}`"),
    }
}

fn validate_method_descriptor(descriptor: &str) -> Result {
    parameter_types(descriptor)?;
    Ok(())
}

/// Returns the parameter types of a method descriptor such as `(I[JLjava/lang/String;)V`, after
/// checking that the descriptor is well formed.
pub(crate) fn parameter_types(descriptor: &str) -> Result<Vec<&str>> {
    let Some(mut rest) = descriptor.strip_prefix('(') else {
        declaration_bail!("method descriptor `{descriptor}` doesn't start with `(`");
    };
    let mut parameters = Vec::new();
    loop {
        if let Some(return_type) = rest.strip_prefix(')') {
            if return_type != "V" && !parse_field_type(return_type)?.is_empty() {
                declaration_bail!("trailing characters after return type in `{descriptor}`");
            }
            return Ok(parameters);
        }
        if rest.is_empty() {
            declaration_bail!("unterminated parameter list in `{descriptor}`");
        }
        let after = parse_field_type(rest)?;
        parameters.push(&rest[..rest.len() - after.len()]);
        rest = after;
    }
}

/// Returns the number of argument slots that the parameters of `descriptor` occupy on the operand
/// stack. Each parameter takes one slot except `long` and `double`, which take two. Arrays are
/// references, so they take one slot whatever their element type.
pub fn parameter_slots(descriptor: &str) -> Result<u16> {
    Ok(parameter_types(descriptor)?
        .iter()
        .map(|parameter| -> u16 {
            match parameter.as_bytes().first() {
                Some(b'J' | b'D') => 2,
                _ => 1,
            }
        })
        .sum())
}

/// A method declared by some class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    owner: ClassName,
    name: String,
    descriptor: String,
    modifiers: Modifiers,
}

/// A field declared by some class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    owner: ClassName,
    name: String,
    field_type: String,
    modifiers: Modifiers,
}

impl MethodDescriptor {
    /// Builds a descriptor for a method of `owner` from a signature such as `f(I)V`. If the
    /// signature is qualified, it must name `owner`.
    pub fn parse(owner: &ClassName, signature: &str, modifiers: Modifiers) -> Result<Self> {
        let parsed = MemberSignature::parse_method(signature)?;
        check_owner(owner, &parsed, signature)?;
        Ok(MethodDescriptor {
            owner: owner.clone(),
            name: parsed.name.to_owned(),
            descriptor: parsed.descriptor.to_owned(),
            modifiers,
        })
    }

    pub fn owner(&self) -> &ClassName {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parenthesised parameters and the return type, e.g. `(IJ)V`.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// The unqualified signature, e.g. `f(IJ)V`.
    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

impl FieldDescriptor {
    /// Builds a descriptor for a field of `owner` from a signature such as `count I`.
    pub fn parse(owner: &ClassName, signature: &str, modifiers: Modifiers) -> Result<Self> {
        let parsed = MemberSignature::parse_field(signature)?;
        check_owner(owner, &parsed, signature)?;
        Ok(FieldDescriptor {
            owner: owner.clone(),
            name: parsed.name.to_owned(),
            field_type: parsed.descriptor.to_owned(),
            modifiers,
        })
    }

    pub fn owner(&self) -> &ClassName {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &str {
        &self.field_type
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    /// The unqualified signature, e.g. `count I`.
    pub fn signature(&self) -> String {
        format!("{} {}", self.name, self.field_type)
    }
}

fn check_owner(owner: &ClassName, parsed: &MemberSignature, signature: &str) -> Result {
    if let Some(declared_owner) = parsed.owner {
        if ClassName::new(declared_owner) != *owner {
            declaration_bail!("signature `{signature}` names a different owner than `{owner}`");
        }
    }
    Ok(())
}

impl Display for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{}", self.owner, self.name, self.descriptor)
    }
}

impl Display for FieldDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}", self.owner, self.name, self.field_type)
    }
}
