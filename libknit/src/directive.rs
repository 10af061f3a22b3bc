//! Recognises linker directives in assembly text and drives the line-by-line passes over a source.
//!
//! A directive occupies a whole line. After optional indentation it starts with `;@`, which the
//! assembler treats as a comment, followed by the directive name and zero or more `|key=value`
//! attributes, e.g. `;@invoke-end|sig=pkg/A/f(I)V|local=false`.

use crate::declaration_bail;
use crate::error::LinkError;
use crate::error::Result;
use crate::error::SourceLocation;
use crate::error::with_location;
use crate::source::Source;
use std::io::BufRead as _;
use winnow::Parser as _;
use winnow::combinator::repeat;
use winnow::token::take_while;

const MARKER: &str = ";@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Class,
    Field,
    Method,
    InvokeBegin,
    InvokeEnd,
    ReadField,
    ClassOf,
    GlueFields,
    GlueInit,
}

const DIRECTIVE_NAMES: &[(&str, DirectiveKind)] = &[
    ("class", DirectiveKind::Class),
    ("field", DirectiveKind::Field),
    ("method", DirectiveKind::Method),
    ("invoke-begin", DirectiveKind::InvokeBegin),
    ("invoke-end", DirectiveKind::InvokeEnd),
    ("read-field", DirectiveKind::ReadField),
    ("class-of", DirectiveKind::ClassOf),
    ("glue-fields", DirectiveKind::GlueFields),
    ("glue-init", DirectiveKind::GlueInit),
];

#[derive(Debug)]
pub struct Directive<'line> {
    kind: DirectiveKind,
    indent: &'line str,
    attributes: Vec<(&'line str, &'line str)>,
}

/// One line of a source, as seen by a pass.
pub(crate) struct Line<'line> {
    pub(crate) number: u32,
    pub(crate) text: &'line str,
    pub(crate) directive: Option<Directive<'line>>,
}

impl DirectiveKind {
    pub fn name(self) -> &'static str {
        DIRECTIVE_NAMES
            .iter()
            .find(|(_, kind)| *kind == self)
            .map_or("?", |(name, _)| name)
    }

    fn from_name(name: &str) -> Option<DirectiveKind> {
        DIRECTIVE_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, kind)| *kind)
    }
}

impl<'line> Directive<'line> {
    /// Parses `line` as a directive. Returns `None` if the line isn't a directive at all.
    pub fn parse(line: &'line str) -> Result<Option<Directive<'line>>> {
        let line = line.trim_end();
        let body = line.trim_start();
        let indent = &line[..line.len() - body.len()];
        let Some(rest) = body.strip_prefix(MARKER) else {
            return Ok(None);
        };
        let (name, attributes) = parse_directive.parse(rest).map_err(|error| {
            LinkError::Declaration(format!("malformed directive `{body}`:\n{error}"))
        })?;
        let Some(kind) = DirectiveKind::from_name(name) else {
            declaration_bail!("unknown directive `{MARKER}{name}`");
        };
        for (i, (key, _)) in attributes.iter().enumerate() {
            if attributes[..i].iter().any(|(previous, _)| previous == key) {
                declaration_bail!("attribute `{key}` given more than once in `{body}`");
            }
        }
        Ok(Some(Directive {
            kind,
            indent,
            attributes,
        }))
    }

    pub fn kind(&self) -> DirectiveKind {
        self.kind
    }

    /// The whitespace before the directive marker. Lines emitted in place of the directive are
    /// indented the same way.
    pub fn indent(&self) -> &'line str {
        self.indent
    }

    pub fn attribute(&self, key: &str) -> Option<&'line str> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| *value)
    }

    pub fn required(&self, key: &str) -> Result<&'line str> {
        match self.attribute(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => declaration_bail!(
                "directive `{MARKER}{}` requires attribute `{key}`",
                self.kind.name()
            ),
        }
    }

    /// Reads a boolean attribute. Absent means false.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.attribute(key) {
            None | Some("false" | "0") => Ok(false),
            Some("true" | "1") => Ok(true),
            Some(other) => declaration_bail!(
                "attribute `{key}` of `{MARKER}{}` must be true or false, got `{other}`",
                self.kind.name()
            ),
        }
    }

    pub fn number(&self, key: &str, default: u16) -> Result<u16> {
        let Some(value) = self.attribute(key) else {
            return Ok(default);
        };
        match value.parse() {
            Ok(number) => Ok(number),
            Err(_) => declaration_bail!(
                "attribute `{key}` of `{MARKER}{}` must be a number, got `{value}`",
                self.kind.name()
            ),
        }
    }
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

fn parse_attribute<'input>(input: &mut &'input str) -> winnow::Result<(&'input str, &'input str)> {
    '|'.parse_next(input)?;
    let key = take_while(1.., is_name_char).parse_next(input)?;
    '='.parse_next(input)?;
    let value = take_while(0.., |ch: char| ch != '|').parse_next(input)?;
    Ok((key, value.trim()))
}

fn parse_directive<'input>(
    input: &mut &'input str,
) -> winnow::Result<(&'input str, Vec<(&'input str, &'input str)>)> {
    let name = take_while(1.., is_name_char).parse_next(input)?;
    let attributes = repeat(0.., parse_attribute).parse_next(input)?;
    Ok((name, attributes))
}

/// Reads `source` from the start, calling `visit` for each line. Line numbers start at 1. Any
/// error, whether from reading, from parsing a directive or from `visit`, gets the source name and
/// line number attached unless it already has a location.
pub(crate) fn for_each_line(
    source: &Source,
    mut visit: impl FnMut(Line) -> Result,
) -> Result {
    let input = source.start_input()?;
    for (index, text) in input.lines().enumerate() {
        let number = index as u32 + 1;
        let location = || SourceLocation {
            source: source.name().to_owned(),
            line: number,
        };
        let text = text.map_err(|error| with_location(error.into(), location))?;
        Directive::parse(&text)
            .and_then(|directive| {
                visit(Line {
                    number,
                    text: &text,
                    directive,
                })
            })
            .map_err(|error| with_location(error, location))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parse_with_attributes() {
        let directive = Directive::parse("\t  ;@class|name=pkg/A |flags=public final|super=pkg/B  ")
            .unwrap()
            .unwrap();
        assert_eq!(directive.kind(), DirectiveKind::Class);
        assert_eq!(directive.indent(), "\t  ");
        assert_eq!(directive.attribute("name"), Some("pkg/A"));
        assert_eq!(directive.required("flags").unwrap(), "public final");
        assert_eq!(directive.attribute("super"), Some("pkg/B"));
        assert_eq!(directive.attribute("implements"), None);
        assert!(directive.required("implements").is_err());
    }

    #[test]
    fn parse_without_attributes() {
        let directive = Directive::parse(";@glue-fields").unwrap().unwrap();
        assert_eq!(directive.kind(), DirectiveKind::GlueFields);
        assert_eq!(directive.indent(), "");
    }

    #[rstest]
    #[case("    aload_0")]
    #[case("; a comment")]
    #[case("")]
    #[case(".method public f()V")]
    #[case("ldc \";@class\"")]
    fn not_a_directive(#[case] line: &str) {
        assert!(Directive::parse(line).unwrap().is_none());
    }

    #[rstest]
    #[case(";@frobnicate")]
    #[case(";@")]
    #[case(";@class|name")]
    #[case(";@class name=A")]
    #[case(";@class|=A")]
    #[case(";@class|name=A|name=B")]
    fn malformed(#[case] line: &str) {
        let error = Directive::parse(line).unwrap_err();
        assert!(matches!(LinkError::of(&error), Some(LinkError::Declaration(_))));
    }

    #[test]
    fn flags_and_numbers() {
        let directive = Directive::parse(";@invoke-end|sig=f()V|local=true|context=3")
            .unwrap()
            .unwrap();
        assert!(directive.flag("local").unwrap());
        assert!(!directive.flag("absent").unwrap());
        assert_eq!(directive.number("context", 1).unwrap(), 3);
        assert_eq!(directive.number("absent", 1).unwrap(), 1);
        assert!(directive.flag("sig").is_err());
        assert!(directive.number("sig", 1).is_err());
    }

    #[test]
    fn errors_get_the_line_number() {
        let (source, _) = Source::in_memory("A.j", "line one\n;@nonsense\n");
        let mut seen = Vec::new();
        let error = for_each_line(&source, |line| {
            seen.push(line.number);
            Ok(())
        })
        .unwrap_err();
        assert_eq!(seen, [1]);
        assert_eq!(
            error.downcast_ref::<SourceLocation>(),
            Some(&SourceLocation {
                source: "A.j".to_owned(),
                line: 2
            })
        );

        // The reader was released, so we can scan again.
        let mut count = 0;
        let error = for_each_line(&source, |line| {
            count += 1;
            if line.number == 1 {
                anyhow::bail!("visitor failed");
            }
            Ok(())
        })
        .unwrap_err();
        assert_eq!(count, 1);
        assert_eq!(format!("{error:#}"), "A.j:1: visitor failed");
    }
}
