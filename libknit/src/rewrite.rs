//! The final pass over a source. Copies the source to its output, replacing each directive with
//! the assembler instructions it stands for.

use crate::directive::Directive;
use crate::directive::DirectiveKind;
use crate::directive::for_each_line;
use crate::discovery::class_header;
use crate::discovery::member_modifiers;
use crate::discovery::split_initial_value;
use crate::error::Result;
use crate::line_table::LineCursor;
use crate::member::Modifiers;
use crate::name::ClassName;
use crate::reference::FieldAccess;
use crate::reference::InvokeKind;
use crate::resolution::Resolution;
use crate::resolution::Resolved;
use crate::resolution::has_pending_operand;
use crate::source::OutputGuard;
use crate::source::Source;
use anyhow::bail;
use itertools::Itertools as _;
use std::fmt::Display;
use std::io::Write as _;

pub const LINE_SEPARATOR: &str = if cfg!(windows) { "\r\n" } else { "\n" };

/// The method that glue initialisation calls on the execution context to obtain a dependency.
const GET_MODULE: &str = "getModule(Ljava/lang/String;)Ljava/lang/Object;";

#[tracing::instrument(skip_all, name = "Rewrite", fields(source = source.name()))]
pub(crate) fn rewrite_source(source: &Source, resolution: &Resolution) -> Result {
    let mut output = source.start_output()?;
    let mut rewriter = Rewriter {
        resolution,
        cursor: resolution.lines.cursor(),
    };
    for_each_line(source, |line| {
        match line.directive {
            None => {
                output.write_all(line.text.as_bytes())?;
                output.write_all(LINE_SEPARATOR.as_bytes())?;
            }
            Some(directive) => {
                let resolved = rewriter.cursor.get(line.number);
                let mut emitter = Emitter {
                    out: &mut output,
                    indent: directive.indent(),
                };
                rewriter.rewrite(&directive, resolved, &mut emitter)?;
            }
        }
        Ok(())
    })?;
    output.finish()
}

struct Rewriter<'pass> {
    resolution: &'pass Resolution,
    cursor: LineCursor<'pass, Resolved>,
}

struct Emitter<'out, 'source> {
    out: &'out mut OutputGuard<'source>,
    indent: &'out str,
}

impl Emitter<'_, '_> {
    fn line(&mut self, text: impl Display) -> Result {
        write!(self.out, "{}{text}{LINE_SEPARATOR}", self.indent)?;
        Ok(())
    }
}

impl Rewriter<'_> {
    fn self_name(&self) -> &ClassName {
        self.resolution.class.name()
    }

    fn rewrite(
        &self,
        directive: &Directive,
        resolved: Option<&Resolved>,
        out: &mut Emitter,
    ) -> Result {
        match (directive.kind(), resolved) {
            (DirectiveKind::Class, _) => self.class_declaration(directive, out),
            (DirectiveKind::Field, _) => {
                let (signature, value) = split_initial_value(directive.required("sig")?);
                let declaration = declaration(".field", member_modifiers(directive)?, signature);
                match value {
                    Some(value) => out.line(format_args!("{declaration} = {value}")),
                    None => out.line(declaration),
                }
            }
            (DirectiveKind::Method, _) => out.line(declaration(
                ".method",
                member_modifiers(directive)?,
                directive.required("sig")?,
            )),
            (DirectiveKind::InvokeBegin, Some(Resolved::Invocation(reference))) => {
                if !reference.kind().needs_receiver() {
                    return Ok(());
                }
                self.load_receiver(reference.owner(), reference.is_local(), out)?;
                if has_pending_operand(directive)? {
                    out.line("swap")?;
                }
                Ok(())
            }
            (DirectiveKind::InvokeEnd, Some(Resolved::Invocation(reference))) => {
                let mnemonic = reference.kind().mnemonic();
                if reference.kind() == InvokeKind::Interface {
                    let count = reference.interface_argument_count()?;
                    out.line(format_args!("{mnemonic} {reference} {count}"))
                } else {
                    out.line(format_args!("{mnemonic} {reference}"))
                }
            }
            (DirectiveKind::ReadField, Some(Resolved::FieldRead(reference))) => {
                if reference.access() == FieldAccess::Instance {
                    self.load_receiver(reference.owner(), reference.is_local(), out)?;
                }
                out.line(format_args!("{} {reference}", reference.access().mnemonic()))
            }
            (DirectiveKind::ClassOf, Some(Resolved::ClassName(owner))) => {
                out.line(format_args!("ldc \"{owner}\""))
            }
            (DirectiveKind::GlueFields, _) => {
                for (owner, field) in self.resolution.glue.iter() {
                    out.line(format_args!(".field private {field} {}", owner.descriptor()))?;
                }
                Ok(())
            }
            (DirectiveKind::GlueInit, _) => self.glue_init(directive, out),
            (kind, resolved) => bail!(
                "Directive `{}` has unexpected resolution {resolved:?}",
                kind.name()
            ),
        }
    }

    fn class_declaration(&self, directive: &Directive, out: &mut Emitter) -> Result {
        let header = class_header(directive)?;
        let keyword = if header.modifiers.is_interface() {
            ".interface"
        } else {
            ".class"
        };
        out.line(declaration(
            keyword,
            header.modifiers.difference(Modifiers::INTERFACE),
            header.name.as_str(),
        ))?;
        if let Some(super_name) = &header.super_name {
            out.line(format_args!(".super {super_name}"))?;
        }
        for interface in &header.interfaces {
            out.line(format_args!(".implements {interface}"))?;
        }
        Ok(())
    }

    /// Loads the instance that a member of `owner` is accessed through. That's the current
    /// instance for local members and members of the current class, otherwise it's the glue field
    /// that holds `owner`.
    fn load_receiver(&self, owner: &ClassName, is_local: bool, out: &mut Emitter) -> Result {
        out.line("aload_0")?;
        if is_local || owner == self.self_name() {
            return Ok(());
        }
        let Some(field) = self.resolution.glue.get(owner) else {
            bail!("No glue field was recorded for `{owner}`");
        };
        out.line(format_args!(
            "getfield {}/{field} {}",
            self.self_name(),
            owner.descriptor()
        ))
    }

    fn glue_init(&self, directive: &Directive, out: &mut Emitter) -> Result {
        let slot = directive.number("context", 1)?;
        let context = self.resolution.glue.context();
        for (owner, field) in self.resolution.glue.iter() {
            out.line("aload_0")?;
            out.line(format_args!("aload {slot}"))?;
            if owner != context {
                out.line(format_args!("ldc \"{owner}\""))?;
                out.line(format_args!("invokevirtual {context}/{GET_MODULE}"))?;
                out.line(format_args!("checkcast {owner}"))?;
            }
            out.line(format_args!(
                "putfield {}/{field} {}",
                self.self_name(),
                owner.descriptor()
            ))?;
        }
        Ok(())
    }
}

/// Formats something like `.method public static f()V`, leaving out the modifiers if there are
/// none.
fn declaration(keyword: &str, modifiers: Modifiers, rest: &str) -> String {
    let keywords = modifiers.keywords(Modifiers::empty()).to_string();
    [keyword, keywords.as_str(), rest]
        .into_iter()
        .filter(|part| !part.is_empty())
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::discover;
    use crate::metadata::InMemoryLoader;
    use crate::resolution::resolve_source;
    use crate::resolver::DiscoveredClass;
    use crate::resolver::Resolver;
    use crate::resolver::tests::class;
    use std::sync::Arc;

    const CONTEXT: &str = "runtime/ExecutionContext";

    /// Links `sources` and returns the output of the last one.
    fn link_last(sources: &[(&str, &str)], loader: InMemoryLoader) -> String {
        let sources: Vec<_> = sources
            .iter()
            .map(|(name, text)| Source::in_memory(*name, *text))
            .collect();
        let discovered: Vec<_> = sources
            .iter()
            .map(|(source, _)| DiscoveredClass {
                source: source.name().to_owned(),
                class: Arc::new(discover(source).unwrap()),
            })
            .collect();
        let referrer = discovered.last().unwrap().class.clone();
        let libraries = loader.iter().cloned().collect();
        let resolver = Resolver::new(discovered, libraries, Arc::new(loader), None).unwrap();
        let (source, output) = sources.last().unwrap();
        let resolution =
            resolve_source(source, &referrer, &resolver, &ClassName::new(CONTEXT)).unwrap();
        rewrite_source(source, &resolution).unwrap();
        source.close().unwrap();
        output.text().unwrap()
    }

    fn lines(text: &str) -> Vec<&str> {
        text.split(LINE_SEPARATOR).collect()
    }

    fn library() -> InMemoryLoader {
        [
            class(
                "lib/Printer",
                Modifiers::PUBLIC,
                None,
                &[
                    ("print(Ljava/lang/String;)V", Modifiers::PUBLIC),
                    ("instance()Llib/Printer;", Modifiers::PUBLIC | Modifiers::STATIC),
                ],
                &[
                    ("OUT Llib/Printer;", Modifiers::PUBLIC | Modifiers::STATIC),
                    ("width I", Modifiers::PUBLIC),
                ],
            ),
            class(
                "lib/Shape",
                Modifiers::PUBLIC | Modifiers::INTERFACE | Modifiers::ABSTRACT,
                None,
                &[("scale(DI[J)V", Modifiers::PUBLIC | Modifiers::ABSTRACT)],
                &[],
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn plain_lines_pass_through() {
        let text = "; header\r\n\ticonst_1  \n\n  ldc \"|=;@\"\n;@class|name=A\n.end method";
        let output = link_last(&[("A.j", text)], InMemoryLoader::new());
        assert_eq!(
            lines(&output),
            [
                "; header",
                "\ticonst_1  ",
                "",
                "  ldc \"|=;@\"",
                ".class A",
                ".super java/lang/Object",
                ".end method",
                "",
            ]
        );
    }

    #[test]
    fn declarations() {
        let output = link_last(
            &[(
                "A.j",
                "\
;@class|name=pkg.A|flags=public final|implements=lib/Shape
  ;@field|sig=count I = 7|flags=static public
;@field|sig=name Ljava/lang/String;|flags=private
;@method|sig=f()V|flags=public
",
            )],
            library(),
        );
        assert_eq!(
            lines(&output),
            [
                ".class public final pkg/A",
                ".super java/lang/Object",
                ".implements lib/Shape",
                "  .field public static count I = 7",
                ".field private name Ljava/lang/String;",
                ".method public f()V",
                "",
            ]
        );

        let output = link_last(
            &[("I.j", ";@class|name=I|flags=public interface abstract\n")],
            library(),
        );
        assert_eq!(
            lines(&output),
            [".interface public abstract I", ".super java/lang/Object", ""]
        );
    }

    #[test]
    fn invocation_variants() {
        let output = link_last(
            &[(
                "pkg/Main.j",
                "\
;@class|name=pkg/Main
;@method|sig=helper(I)V|flags=private
;@method|sig=run()V|flags=public static
    ;@invoke-begin|pending=1
    ;@invoke-end|sig=print(Ljava/lang/String;)V
    ;@invoke-begin|pending=0
    ;@invoke-end|sig=lib/Printer/instance()Llib/Printer;
    ;@invoke-begin|pending=0
    ;@invoke-end|sig=helper(I)V|local=true
    ;@invoke-begin|pending=0
    ;@invoke-end|sig=run()V|local=true
    ;@invoke-begin|pending=0
    ;@invoke-end|sig=lib/Shape/scale(DI[J)V
",
            )],
            library(),
        );
        assert_eq!(
            lines(&output)[4..],
            [
                "    aload_0",
                "    getfield pkg/Main/glue$printer1 Llib/Printer;",
                "    swap",
                "    invokevirtual lib/Printer/print(Ljava/lang/String;)V",
                "    invokestatic lib/Printer/instance()Llib/Printer;",
                "    aload_0",
                "    invokespecial pkg/Main/helper(I)V",
                "    invokestatic pkg/Main/run()V",
                "    aload_0",
                "    getfield pkg/Main/glue$shape2 Llib/Shape;",
                "    invokeinterface lib/Shape/scale(DI[J)V 5",
                "",
            ]
        );
    }

    #[test]
    fn field_reads_and_class_names() {
        let output = link_last(
            &[(
                "A.j",
                "\
;@class|name=A
;@field|sig=own I|flags=private
;@read-field|sig=lib/Printer/OUT Llib/Printer;
;@read-field|sig=width I
;@read-field|sig=own I|local=true
;@class-of|sig=print(Ljava/lang/String;)V
",
            )],
            library(),
        );
        assert_eq!(
            lines(&output)[3..],
            [
                "getstatic lib/Printer/OUT Llib/Printer;",
                "aload_0",
                "getfield A/glue$printer1 Llib/Printer;",
                "getfield lib/Printer/width I",
                "aload_0",
                "getfield A/own I",
                "ldc \"lib/Printer\"",
                "",
            ]
        );
    }

    #[test]
    fn glue() {
        let output = link_last(
            &[(
                "A.j",
                "\
;@class|name=A
;@glue-fields
.method public <init>(Lruntime/ExecutionContext;)V
  ;@glue-init|context=1
  return
.end method
;@read-field|sig=width I
",
            )],
            library(),
        );
        assert_eq!(
            lines(&output)[2..],
            [
                ".field private glue$executioncontext0 Lruntime/ExecutionContext;",
                ".field private glue$printer1 Llib/Printer;",
                ".method public <init>(Lruntime/ExecutionContext;)V",
                "  aload_0",
                "  aload 1",
                "  putfield A/glue$executioncontext0 Lruntime/ExecutionContext;",
                "  aload_0",
                "  aload 1",
                "  ldc \"lib/Printer\"",
                "  invokevirtual runtime/ExecutionContext/getModule(Ljava/lang/String;)Ljava/lang/Object;",
                "  checkcast lib/Printer",
                "  putfield A/glue$printer1 Llib/Printer;",
                "  return",
                ".end method",
                "aload_0",
                "getfield A/glue$printer1 Llib/Printer;",
                "getfield lib/Printer/width I",
                "",
            ]
        );
    }
}
