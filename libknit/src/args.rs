//! A handwritten parser for our arguments.
//!
//! We don't use a third-party crate for this for the same reason linkers generally don't: the
//! options are a mix of short options that take a separate value (`-l Foo`) and long options that
//! accept either one or two dashes.

use crate::error::Result;
use anyhow::Context as _;
use anyhow::bail;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONTEXT_CLASS: &str = "runtime/ExecutionContext";

pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Args {
    /// Each input source together with where its output goes. When no output is given, the input
    /// is replaced.
    pub inputs: Vec<(PathBuf, Option<PathBuf>)>,

    /// Library classes to load up front. Unqualified signatures are looked up in these after the
    /// job's own sources.
    pub libraries: Vec<String>,

    /// Directories to search for class files.
    pub class_path: Vec<PathBuf>,

    /// Where calls that resolve nowhere are sent. Without this, such calls are an error.
    pub unresolved_target: Option<String>,

    pub context_class: String,
    pub num_threads: NonZeroUsize,
    pub shutdown_timeout: Duration,
    pub time_phases: bool,
}

#[derive(Debug)]
pub enum Action {
    /// The default. Link something.
    Link(Args),

    /// Print the version and exit.
    Version,
}

impl Action {
    /// Parses the supplied arguments, which should not include the program name.
    pub fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Action> {
        parse(input)
    }
}

pub(crate) fn available_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

impl Default for Args {
    fn default() -> Self {
        Args {
            inputs: Vec::new(),
            libraries: Vec::new(),
            class_path: Vec::new(),
            unresolved_target: None,
            context_class: DEFAULT_CONTEXT_CLASS.to_owned(),
            num_threads: available_parallelism(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            time_phases: false,
        }
    }
}

// Parse the supplied input arguments, which should not include the program name.
pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(mut input: I) -> Result<Action> {
    let mut args = Args::default();
    let mut unrecognised = Vec::new();

    while let Some(arg) = input.next() {
        let arg = arg.as_ref();

        fn strip_option(arg: &str) -> Option<&str> {
            arg.strip_prefix("--").or(arg.strip_prefix('-'))
        }
        let long_arg_eq = |option: &str| {
            assert!(
                !option.starts_with('-'),
                "option cannot start with a dash: `{option}`"
            );
            strip_option(arg) == Some(option)
        };
        let long_arg_split_prefix = |option: &str| -> Option<&str> {
            assert!(!option.starts_with('-'));
            assert!(option.ends_with('='));
            strip_option(arg).and_then(|stripped_arg| stripped_arg.strip_prefix(option))
        };

        if arg == "-l" {
            let Some(class) = input.next() else {
                bail!("Missing class name after -l");
            };
            args.libraries.push(class.as_ref().to_owned());
        } else if let Some(class) = long_arg_split_prefix("lib=") {
            args.libraries.push(class.to_owned());
        } else if arg == "-cp" || long_arg_eq("classpath") {
            let Some(paths) = input.next() else {
                bail!("Missing directories after {arg}");
            };
            args.class_path.extend(std::env::split_paths(paths.as_ref()));
        } else if let Some(paths) = long_arg_split_prefix("classpath=") {
            args.class_path.extend(std::env::split_paths(paths));
        } else if let Some(class) = long_arg_split_prefix("unresolved=") {
            args.unresolved_target = Some(class.to_owned());
        } else if let Some(class) = long_arg_split_prefix("context=") {
            args.context_class = class.to_owned();
        } else if let Some(rest) = long_arg_split_prefix("threads=") {
            args.num_threads = NonZeroUsize::try_from(
                rest.parse::<usize>()
                    .with_context(|| format!("Invalid thread count `{rest}`"))?,
            )?;
        } else if let Some(rest) = long_arg_split_prefix("shutdown-timeout-ms=") {
            args.shutdown_timeout = Duration::from_millis(
                rest.parse()
                    .with_context(|| format!("Invalid shutdown timeout `{rest}`"))?,
            );
        } else if long_arg_eq("time") {
            args.time_phases = true;
        } else if long_arg_eq("version") || arg == "-v" {
            return Ok(Action::Version);
        } else if long_arg_eq("help") {
            bail!("Usage: knit [options] <input>[=<output>]...");
        } else if arg.starts_with('-') {
            unrecognised.push(format!("`{arg}`"));
        } else {
            args.inputs.push(match arg.split_once('=') {
                Some((input, output)) => (PathBuf::from(input), Some(PathBuf::from(output))),
                None => (PathBuf::from(arg), None),
            });
        }
    }

    if !unrecognised.is_empty() {
        bail!("Unrecognised argument(s): {}", unrecognised.join(" "));
    }
    if args.inputs.is_empty() {
        bail!("No input sources were given");
    }

    Ok(Action::Link(args))
}
