//! Tests that link the test programs under `tests/sources`, then check the output of each source.
//! Each directory there is one job. Its `.j` files, in name order, are the job's sources.
//!
//! The sources can contain directives that affect linking as well as assertions about the output.
//! Directives have the format ';#Directive:Args'. Being comments, they pass through linking
//! unchanged, but are ignored when checking output.
//!
//! LinkArgs:... Arguments to pass to the linker, in addition to the inputs.
//!
//! ExpectError:{error string} Verifies that the link fails and that the error message, including
//! the source and line it's attributed to, includes the specified string.
//!
//! Contains:{string} Checks that the output of the source containing the directive includes the
//! string.
//!
//! DoesNotContain:{string} Checks that the output of the source containing the directive doesn't
//! include the string.

use anyhow::Context as _;
use anyhow::bail;
use libknit::LINE_SEPARATOR;
use libknit::LinkJob;
use libknit::Linker;
use libknit::LinkerConfig;
use libknit::args::Action;
use libknit::class::ClassDescriptor;
use libknit::class::ClassHeader;
use libknit::error::LinkError;
use libknit::member::MethodDescriptor;
use libknit::member::Modifiers;
use libknit::metadata::InMemoryLoader;
use libknit::name::ClassName;
use libknit::source::MemoryOutput;
use libknit::source::Source;
use rstest::rstest;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

type Result<T = (), E = anyhow::Error> = core::result::Result<T, E>;

#[derive(Default, Debug)]
struct Config {
    link_args: Vec<String>,
    expect_error: Option<String>,
    assertions: Vec<Assertion>,
}

#[derive(Debug)]
struct Assertion {
    source: PathBuf,
    contains: bool,
    text: String,
}

fn sources_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/sources")
}

fn program_sources(program_name: &str) -> Result<Vec<PathBuf>> {
    let dir = sources_dir().join(program_name);
    let mut sources = Vec::new();
    let entries =
        std::fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "j") {
            sources.push(path);
        }
    }
    sources.sort();
    Ok(sources)
}

fn parse_config(sources: &[PathBuf]) -> Result<Config> {
    let mut config = Config::default();
    for path in sources {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for line in text.lines() {
            let Some(rest) = line.trim().strip_prefix(";#") else {
                continue;
            };
            let (directive, arg) = rest.split_once(':').context("Missing arg")?;
            let arg = arg.trim();
            match directive {
                "LinkArgs" => config
                    .link_args
                    .extend(arg.split_whitespace().map(str::to_owned)),
                "ExpectError" => config.expect_error = Some(arg.to_owned()),
                "Contains" | "DoesNotContain" => config.assertions.push(Assertion {
                    source: path.clone(),
                    contains: directive == "Contains",
                    text: arg.to_owned(),
                }),
                other => bail!("{}: unknown test directive `{other}`", path.display()),
            }
        }
    }
    Ok(config)
}

/// Reads an output file, leaving out test directives.
fn read_output(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read output {}", path.display()))?;
    Ok(text
        .split(LINE_SEPARATOR)
        .filter(|line| !line.trim_start().starts_with(";#"))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[rstest]
fn integration_test(
    #[values(
        "unqualified_static",
        "private_target",
        "catch_all",
        "glue_names",
        "duplicate_class",
        "interface_call",
        "local_calls",
        "unbalanced"
    )]
    program_name: &'static str,
) -> Result {
    let sources = program_sources(program_name)?;
    let config = parse_config(&sources)
        .with_context(|| format!("Failed to parse test parameters from `{program_name}`"))?;
    let out_dir = tempfile::tempdir()?;

    let output_path = |source: &Path| out_dir.path().join(source.file_name().unwrap());
    let mut args = config.link_args.clone();
    args.push("--threads=2".to_owned());
    args.extend(sources.iter().map(|source| {
        format!("{}={}", source.display(), output_path(source).display())
    }));

    let result = libknit::run(&Action::parse(args.iter())?);

    match (&config.expect_error, result) {
        (Some(expected), Err(error)) => {
            let message = format!("{error:#}");
            if !message.contains(expected.as_str()) {
                bail!("Expected error containing `{expected}`, got `{message}`");
            }
        }
        (Some(expected), Ok(())) => bail!("Link succeeded, but expected error `{expected}`"),
        (None, Err(error)) => return Err(error.context(format!("Failed to link {program_name}"))),
        (None, Ok(())) => {}
    }

    for assertion in &config.assertions {
        let output = read_output(&output_path(&assertion.source))?;
        if output.contains(&assertion.text) != assertion.contains {
            bail!(
                "Output of {} {} `{}`:\n{output}",
                assertion.source.display(),
                if assertion.contains {
                    "doesn't contain"
                } else {
                    "contains"
                },
                assertion.text
            );
        }
    }

    Ok(())
}

fn linker(loader: InMemoryLoader) -> Linker {
    Linker::new(
        Arc::new(loader),
        LinkerConfig {
            num_threads: NonZeroUsize::new(4).unwrap(),
            ..Default::default()
        },
    )
}

fn memory_job(sources: &[(&str, &str)]) -> (LinkJob, Vec<MemoryOutput>) {
    let (sources, outputs): (Vec<_>, Vec<_>) = sources
        .iter()
        .map(|(name, text)| {
            let (source, output) = Source::in_memory(*name, *text);
            (Arc::new(source), output)
        })
        .unzip();
    (
        LinkJob {
            sources,
            ..Default::default()
        },
        outputs,
    )
}

fn library_class(
    name: &str,
    modifiers: Modifiers,
    methods: &[(&str, Modifiers)],
) -> ClassDescriptor {
    let name = ClassName::new(name);
    let methods = methods
        .iter()
        .map(|(signature, modifiers)| {
            MethodDescriptor::parse(&name, signature, *modifiers).unwrap()
        })
        .collect();
    ClassDescriptor::new(
        ClassHeader {
            name,
            modifiers,
            super_name: Some(ClassName::new("java/lang/Object")),
            interfaces: Vec::new(),
        },
        methods,
        Vec::new(),
    )
}

fn library_loader() -> InMemoryLoader {
    let public_static = Modifiers::PUBLIC | Modifiers::STATIC;
    [
        library_class(
            "lib/Console",
            Modifiers::PUBLIC,
            &[("println(Ljava/lang/String;)V", public_static)],
        ),
        library_class(
            "lib/Buffer",
            Modifiers::PUBLIC,
            &[("append(Ljava/lang/String;)V", Modifiers::PUBLIC)],
        ),
    ]
    .into_iter()
    .map(Arc::new)
    .collect()
}

const CALLS_LIBRARIES: &str = "\
;@class|name=app/Main|flags=public
;@glue-fields
;@method|sig=run()V|flags=public
    ldc \"hello\"
    ;@invoke-begin|pending=1
    ;@invoke-end|sig=lib.Buffer.append(Ljava/lang/String;)V
    ldc \"world\"
    ;@invoke-begin
    ;@invoke-end|sig=println(Ljava/lang/String;)V
    return
.end method
";

#[test]
fn resolves_against_libraries() {
    let (mut job, outputs) = memory_job(&[("Main.j", CALLS_LIBRARIES)]);
    job.libraries.push(ClassName::new("lib/Console"));
    linker(library_loader()).link(&job).unwrap();
    let output = outputs[0].text().unwrap();
    let lines: Vec<&str> = output.split(LINE_SEPARATOR).map(str::trim).collect();
    // `lib/Buffer` isn't one of the job's libraries, but it's loaded when named.
    for expected in [
        "getfield app/Main/glue$buffer1 Llib/Buffer;",
        "swap",
        "invokevirtual lib/Buffer/append(Ljava/lang/String;)V",
        "invokestatic lib/Console/println(Ljava/lang/String;)V",
        ".field private glue$console2 Llib/Console;",
    ] {
        assert!(lines.contains(&expected), "Missing `{expected}` in:\n{output}");
    }
}

#[test]
fn unqualified_lookup_needs_library_to_be_listed() {
    let (job, outputs) = memory_job(&[("Main.j", CALLS_LIBRARIES)]);
    let error = linker(library_loader()).link(&job).unwrap_err();
    assert!(matches!(
        LinkError::of(&error),
        Some(LinkError::Resolution(_))
    ));
    assert_eq!(
        format!("{error:#}"),
        "Main.j:9: unable to resolve public member `println(Ljava/lang/String;)V`"
    );
    assert!(outputs[0].text().is_none());
}

#[test]
fn sources_shadow_libraries() {
    let console = ";@class|name=lib/Console|flags=public\n;@method|sig=print()V|flags=public static\n";
    let caller = |signature: &str| {
        format!(";@class|name=app/Main\n;@invoke-begin\n;@invoke-end|sig={signature}\n")
    };

    let uses_source = caller("print()V");
    let (mut job, outputs) =
        memory_job(&[("Console.j", console), ("Main.j", uses_source.as_str())]);
    job.libraries.push(ClassName::new("lib/Console"));
    linker(library_loader()).link(&job).unwrap();
    assert!(outputs[1].text().unwrap().contains("invokestatic lib/Console/print()V"));

    let uses_library = caller("println(Ljava/lang/String;)V");
    let (mut job, _) =
        memory_job(&[("Console.j", console), ("Main.j", uses_library.as_str())]);
    job.libraries.push(ClassName::new("lib/Console"));
    assert!(linker(library_loader()).link(&job).is_err());
}

#[test]
fn concurrent_links_are_deterministic() {
    let mut sources = vec![(
        "Main.j".to_owned(),
        String::from(";@class|name=app/Main\n;@glue-fields\n;@method|sig=run()V|flags=public\n"),
    )];
    for i in 0..20 {
        sources.push((
            format!("Dep{i}.j"),
            format!(";@class|name=pkg{i}/Dep|flags=public\n;@method|sig=f{i}()V|flags=public\n"),
        ));
        sources[0].1.push_str(&format!(
            "    ;@invoke-begin\n    ;@invoke-end|sig=f{i}()V\n    ;@class-of|sig=f{i}()V\n"
        ));
    }
    let sources: Vec<(&str, &str)> = sources
        .iter()
        .map(|(name, text)| (name.as_str(), text.as_str()))
        .collect();

    let link_main = || {
        let (job, outputs) = memory_job(&sources);
        linker(InMemoryLoader::new()).link(&job).unwrap();
        outputs[0].text().unwrap()
    };
    let first = link_main();
    assert!(first.contains(".field private glue$dep20 Lpkg19/Dep;"));
    assert!(first.contains("invokevirtual pkg7/Dep/f7()V"));
    for _ in 0..5 {
        assert_eq!(link_main(), first);
    }
}

#[test]
fn non_directive_lines_round_trip() {
    let body = ["; comment", "", "  .limit stack 4", "\tiload_1 ; @not-a-directive", "return"];
    let mut text = String::from(";@class|name=A\r\n");
    text.push_str(&body.join("\r\n"));
    let (job, outputs) = memory_job(&[("A.j", text.as_str())]);
    linker(InMemoryLoader::new()).link(&job).unwrap();
    let expected: String = [".class A", ".super java/lang/Object"]
        .into_iter()
        .chain(body)
        .map(|line| format!("{line}{LINE_SEPARATOR}"))
        .collect();
    assert_eq!(outputs[0].text().unwrap(), expected);
}

#[test]
fn replaces_input_without_output_path() -> Result {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("A.j");
    std::fs::write(&input, ";@class|name=A|flags=public\n;@glue-fields\n")?;
    let args = ["--context=rt/Ctx".to_owned(), input.display().to_string()];
    libknit::run(&Action::parse(args.iter())?)?;
    let expected = [
        ".class public A",
        ".super java/lang/Object",
        ".field private glue$ctx0 Lrt/Ctx;",
    ]
    .map(|line| format!("{line}{LINE_SEPARATOR}"))
    .concat();
    assert_eq!(std::fs::read_to_string(&input)?, expected);
    // Nothing else, such as a leftover temporary file, is in the directory.
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    Ok(())
}

#[test]
fn failed_sources_keep_their_inputs() -> Result {
    let dir = tempfile::tempdir()?;
    let good = dir.path().join("Good.j");
    let bad = dir.path().join("Bad.j");
    let bad_text = ";@class|name=Bad\n;@read-field|sig=missing I\n";
    std::fs::write(&good, ";@class|name=Good\n")?;
    std::fs::write(&bad, bad_text)?;
    let args = [good.display().to_string(), bad.display().to_string()];
    let error = libknit::run(&Action::parse(args.iter())?).unwrap_err();
    assert!(format!("{error:#}").contains("Bad.j:2: unable to resolve public member `missing I`"));
    assert_eq!(std::fs::read_to_string(&bad)?, bad_text);
    assert!(std::fs::read_to_string(&good)?.starts_with(".class Good"));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 2);
    Ok(())
}

#[test]
fn version() -> Result {
    assert!(matches!(
        Action::parse(["--version"].iter())?,
        Action::Version
    ));
    libknit::run(&Action::Version)
}
